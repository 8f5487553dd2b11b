//! Fuzz target: wallet normalization
//!
//! 1. No panics on any input
//! 2. Parsing is idempotent: parse(parse(s)) == parse(s)
//!
//! Run: cargo +nightly fuzz run fuzz_wallet_parse -- -max_len=256

#![no_main]
use hive_core::{Wallet, MAX_WALLET_LEN};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(wallet) = Wallet::parse(s) {
            assert!(wallet.as_bytes().len() <= MAX_WALLET_LEN);
            let again = Wallet::parse(wallet.as_str()).expect("normalized wallet must re-parse");
            assert_eq!(again, wallet);
        }
    }
});
