//! Runtime options read from the `UTHREAD_OPTIONS` environment variable.
//!
//! The option string is a whitespace-separated list of `key` or `key=value` entries. Values may be quoted with `"` or `'` to include
//! whitespace, e.g. `UTHREAD_OPTIONS="stack_size=131072 log=debug"`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::runtime::RuntimeConfig;

pub const OPTIONS_VAR: &str = "UTHREAD_OPTIONS";

static OPTIONS: spin::Lazy<RuntimeOptions> = spin::Lazy::new(|| RuntimeOptions::new(&std::env::var(OPTIONS_VAR).unwrap_or_default()));

pub struct RuntimeOptions {
    options: BTreeMap<String, Option<String>>,
    warned_invalid: spin::Mutex<BTreeSet<String>>
}

impl RuntimeOptions {
    pub fn new(mut s: &str) -> Self {
        let mut options = BTreeMap::new();

        s = s.trim_start();

        while !s.is_empty() {
            let key_end = s.find(|c: char| c.is_whitespace() || c == '=').unwrap_or(s.len());
            let key = &s[..key_end];

            let val = if s[key_end..].starts_with('=') {
                s = &s[key_end + 1..];

                let val = match s.chars().next() {
                    Some(quote @ ('"' | '\'')) => {
                        s = &s[1..];

                        let val_end = s.find(quote).unwrap_or(s.len());

                        let val = &s[..val_end];
                        s = &s[(val_end + 1).min(s.len())..];

                        val
                    },
                    _ => {
                        let val_end = s.find(|c: char| c.is_whitespace()).unwrap_or(s.len());

                        let val = &s[..val_end];
                        s = &s[val_end..];

                        val
                    }
                };

                Some(val.to_owned())
            } else {
                s = &s[key_end..];
                None
            };

            options.insert(key.to_owned(), val);
            s = s.trim_start();
        }

        RuntimeOptions {
            options,
            warned_invalid: spin::Mutex::new(BTreeSet::new())
        }
    }

    pub fn try_get<T: OptionParseable>(&self, key: &str) -> Option<Option<Result<T, InvalidOptionValue>>> {
        self.options.get(key).map(|val| val.as_deref().map(T::try_parse_opt))
    }

    pub fn warn_invalid(key: &str) {
        log::warn!("Invalid value given for option '{}'", key);
    }

    pub fn warn_invalid_once(&self, key: &str) {
        if self.warned_invalid.lock().insert(key.to_owned()) {
            Self::warn_invalid(key);
        }
    }

    pub fn get<T: OptionParseable>(&self, key: &str) -> Option<T> {
        match self.try_get(key) {
            Some(Some(Ok(val))) => Some(val),
            Some(_) => {
                self.warn_invalid_once(key);
                None
            },
            None => None
        }
    }

    pub fn get_flag(&self, key: &str) -> Option<bool> {
        match self.try_get(key) {
            Some(Some(Ok(val))) => Some(val),
            Some(None) => Some(true),
            Some(Some(Err(_))) => {
                self.warn_invalid_once(key);
                None
            },
            None => None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Builds a runtime configuration from these options, using defaults for anything that is missing or invalid.
    pub fn config(&self) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();

        if let Some(stack_size) = self.get("stack_size") {
            config.stack_size = stack_size;
        }

        if let Some(max_threads) = self.get("max_threads") {
            config.max_threads = max_threads;
        }

        if let Some(timeslice) = self.get::<u64>("timeslice_us") {
            config.timeslice = Duration::from_micros(timeslice);
        }

        if let Some(iterations) = self.get("destructor_iterations") {
            config.destructor_iterations = iterations;
        }

        if config.validate().is_err() {
            log::warn!("Ignoring invalid runtime options from {}", OPTIONS_VAR);
            RuntimeConfig::default()
        } else {
            config
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidOptionValue;

pub trait OptionParseable
where
    Self: Sized
{
    fn try_parse_opt(s: &str) -> Result<Self, InvalidOptionValue>;
}

impl OptionParseable for String {
    fn try_parse_opt(s: &str) -> Result<Self, InvalidOptionValue> {
        Ok(s.to_owned())
    }
}

macro_rules! impl_parseable_int {
    ($($ty:ty),*) => {
        $(
            impl OptionParseable for $ty {
                fn try_parse_opt(s: &str) -> Result<Self, InvalidOptionValue> {
                    s.parse().map_err(|_| InvalidOptionValue)
                }
            }
        )*
    };
}

impl_parseable_int!(u32, i32, u64, i64, usize, isize);

impl OptionParseable for bool {
    fn try_parse_opt(s: &str) -> Result<Self, InvalidOptionValue> {
        match s {
            "0" | "false" | "no" => Ok(false),
            "1" | "true" | "yes" => Ok(true),
            _ => Err(InvalidOptionValue)
        }
    }
}

impl OptionParseable for log::LevelFilter {
    fn try_parse_opt(s: &str) -> Result<Self, InvalidOptionValue> {
        s.parse().map_err(|_| InvalidOptionValue)
    }
}

static CONFIG: spin::Lazy<RuntimeConfig> = spin::Lazy::new(|| get().config());

/// Gets the options parsed from the environment. The environment is only read the first time this is called.
pub fn get() -> &'static RuntimeOptions {
    &OPTIONS
}

/// Gets the runtime configuration given by the environment.
pub fn config() -> &'static RuntimeConfig {
    &CONFIG
}
