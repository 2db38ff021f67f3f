use proptest::prelude::*;

/// Small key space so submissions collide often
pub fn key_strategy() -> impl Strategy<Value = u8> {
    0u8..8
}

/// Sequence of `(key, payload)` submissions
pub fn submission_strategy() -> impl Strategy<Value = Vec<(u8, u32)>> {
    prop::collection::vec((key_strategy(), any::<u32>()), 1..64)
}

/// Key names shaped like resource identifiers
pub fn resource_key_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,8}:[0-9]{1,4}"
}
