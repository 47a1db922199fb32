mod relocation_case1;
