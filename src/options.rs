//! Process-wide tunables, read once from the environment (SPEC_FULL
//! section 2.3). Mirrors the teacher's pattern of a lazily-initialized
//! `OnceLock<Options>` rather than a config file or builder API, since
//! every knob here is a boolean/numeric override an operator sets before
//! the process starts.

use std::env;
use std::sync::OnceLock;

pub struct Options {
    pub verbose: bool,
    pub free_sp_multiplier: usize,
    pub page_block_cache: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            verbose: false,
            free_sp_multiplier: 2,
            page_block_cache: true,
        }
    }
}

fn parse_bool(val: &str) -> bool {
    matches!(val, "1" | "true" | "TRUE" | "yes" | "on")
}

fn from_env() -> Options {
    let mut opts = Options::default();

    if let Ok(v) = env::var("SUPERALLOC_VERBOSE") {
        opts.verbose = parse_bool(&v);
    }
    if let Ok(v) = env::var("SUPERALLOC_FREE_SP_MULTIPLIER") {
        match v.parse::<usize>() {
            Ok(n) if n > 0 => opts.free_sp_multiplier = n,
            _ => log::warn!("ignoring invalid SUPERALLOC_FREE_SP_MULTIPLIER={:?}", v),
        }
    }
    if let Ok(v) = env::var("SUPERALLOC_PAGE_BLOCK_CACHE") {
        opts.page_block_cache = parse_bool(&v);
    }

    if opts.verbose {
        log::info!(
            "superalloc options: free_sp_multiplier={} page_block_cache={}",
            opts.free_sp_multiplier,
            opts.page_block_cache
        );
    }
    opts
}

static OPTIONS: OnceLock<Options> = OnceLock::new();

pub fn get() -> &'static Options {
    OPTIONS.get_or_init(from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_spec_constants() {
        let opts = Options::default();
        assert_eq!(opts.free_sp_multiplier, 2);
        assert!(opts.page_block_cache);
    }

    #[test]
    fn parses_common_boolean_spellings() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("nope"));
    }
}
