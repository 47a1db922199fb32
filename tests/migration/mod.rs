mod move_chunk_case1;
mod split_shard_case1;
