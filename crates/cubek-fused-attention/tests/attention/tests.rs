use crate::suite::launcher::{problem, test_forward, test_strategies_agree};

#[test]
fn d64_single_tile() {
    test_forward(problem(1, 1, 1, 64, 128, 64, false), dtype());
}

#[test]
fn d128_full_block() {
    test_forward(problem(1, 2, 2, 192, 256, 128, false), dtype());
}

#[test]
fn d256_multiple_blocks() {
    test_forward(problem(1, 1, 1, 256, 256, 256, false), dtype());
}

#[test]
fn ragged_query_rows() {
    test_forward(problem(1, 1, 1, 100, 128, 64, false), dtype());
}

#[test]
fn ragged_key_tiles() {
    test_forward(problem(1, 1, 1, 64, 200, 128, false), dtype());
}

#[test]
fn shorter_keys_than_queries() {
    test_forward(problem(1, 1, 1, 300, 70, 64, false), dtype());
}

#[test]
fn causal_square() {
    test_forward(problem(1, 1, 1, 256, 256, 64, true), dtype());
}

#[test]
fn causal_across_blocks() {
    test_forward(problem(1, 2, 2, 400, 400, 128, true), dtype());
}

#[test]
fn causal_ragged_wide_heads() {
    test_forward(problem(1, 1, 1, 150, 150, 256, true), dtype());
}

#[test]
fn grouped_query_heads() {
    test_forward(problem(1, 4, 1, 128, 192, 64, false), dtype());
}

#[test]
fn grouped_query_heads_causal() {
    test_forward(problem(2, 6, 2, 200, 200, 128, true), dtype());
}

#[test]
fn batched() {
    test_forward(problem(3, 2, 2, 64, 64, 64, false), dtype());
}

#[test]
fn causal_block_ends_on_last_query() {
    // One cube covers 192 rows at D=64 and 128 at D=256
    test_forward(problem(1, 1, 1, 192, 192, 64, true), dtype());
    test_forward(problem(1, 1, 1, 128, 128, 256, true), dtype());
}

#[test]
fn causal_block_spills_one_query() {
    test_forward(problem(1, 1, 1, 193, 193, 64, true), dtype());
    test_forward(problem(1, 1, 1, 129, 129, 256, true), dtype());
}

#[test]
fn causal_block_against_longer_keys() {
    // Second cube starts at row 192 and must stream exactly three key tiles
    test_forward(problem(1, 1, 1, 193, 512, 64, true), dtype());
}

#[test]
fn strategies_agree_d64() {
    test_strategies_agree(problem(1, 2, 1, 150, 200, 64, true), dtype());
}

#[test]
fn strategies_agree_d128() {
    test_strategies_agree(problem(1, 1, 1, 192, 256, 128, false), dtype());
}

#[test]
fn strategies_agree_d256() {
    test_strategies_agree(problem(1, 1, 1, 100, 130, 256, true), dtype());
}

#[test]
fn strategies_agree_many_ragged_tiles() {
    test_strategies_agree(problem(1, 2, 2, 130, 700, 128, false), dtype());
}
