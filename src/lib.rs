#![deny(clippy::unwrap_used)]

use anyhow::Context;
use log_error::LogError;
use once_cell::sync::Lazy;

pub mod category;
pub mod control;
pub mod dedup;
pub mod export;
pub mod fetch;
pub mod ingest;
pub mod job;
pub mod link;
pub mod product;
pub mod product_image;
pub mod retry;
pub mod sheet;
pub mod storage;

pub static SELF_ADDR: Lazy<String> = Lazy::new(|| {
    envmnt::get_parse("SELF_ADDR")
        .context("SELF_ADDR not set")
        .log_error("Unable to get SELF_ADDR")
        .unwrap_or("0.0.0.0".to_string())
});

pub fn env_flag(key: &str, default_value: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default_value,
        },
        Err(_) => default_value,
    }
}

#[cfg(test)]
pub mod test {

    use super::*;

    #[test]
    fn parses_env_flags() {
        std::env::set_var("CATALOG_TEST_FLAG", "yes");
        assert!(env_flag("CATALOG_TEST_FLAG", false));
        std::env::set_var("CATALOG_TEST_FLAG", "0");
        assert!(!env_flag("CATALOG_TEST_FLAG", true));
        assert!(env_flag("CATALOG_TEST_FLAG_MISSING", true));
    }
}
