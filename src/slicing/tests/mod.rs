mod blocks_tests;
