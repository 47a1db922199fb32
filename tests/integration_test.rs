mod common;
mod migration;
mod recovery;
mod relocation;
