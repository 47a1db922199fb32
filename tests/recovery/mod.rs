mod recovery_case1;
