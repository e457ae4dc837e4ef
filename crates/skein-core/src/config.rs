// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Configuration capability.
//!
//! A `ConfigProvider` answers string lookups by key; `Config<T>`
//! descriptors turn those strings into typed values.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

use crate::effect::{Data, Effect};
use crate::instr::Instr;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing configuration value `{key}`")]
    Missing { key: String },
    #[error("invalid configuration value `{key}` = {value:?}: expected {expected}")]
    Invalid {
        key: String,
        value: String,
        expected: &'static str,
    },
}

pub trait ConfigProvider: Send + Sync + 'static {
    fn load(&self, key: &str) -> Option<String>;
}

/// Reads process environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvConfigProvider;

impl ConfigProvider for EnvConfigProvider {
    fn load(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed key/value pairs, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfigProvider {
    values: IndexMap<String, String>,
}

impl MapConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapConfigProvider {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl ConfigProvider for MapConfigProvider {
    fn load(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

type Reader<T> = Arc<dyn Fn(&dyn ConfigProvider) -> Result<T, ConfigError> + Send + Sync>;

/// Description of one configuration value.
pub struct Config<T> {
    read: Reader<T>,
}

impl<T> Clone for Config<T> {
    fn clone(&self) -> Self {
        Self {
            read: self.read.clone(),
        }
    }
}

impl<T> fmt::Debug for Config<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Config<{}>", std::any::type_name::<T>())
    }
}

impl<T: Send + 'static> Config<T> {
    pub fn from_fn(
        read: impl Fn(&dyn ConfigProvider) -> Result<T, ConfigError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            read: Arc::new(read),
        }
    }

    /// Parse `key` with `FromStr`; `expected` names the format in errors.
    pub fn parse(key: impl Into<String>, expected: &'static str) -> Self
    where
        T: FromStr,
    {
        let key = key.into();
        Self::from_fn(move |p| {
            let raw = p.load(&key).ok_or_else(|| ConfigError::Missing { key: key.clone() })?;
            raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
                key: key.clone(),
                value: raw.clone(),
                expected,
            })
        })
    }

    pub fn read(&self, provider: &dyn ConfigProvider) -> Result<T, ConfigError> {
        (self.read)(provider)
    }

    pub fn map<U: Send + 'static>(&self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Config<U> {
        let read = self.read.clone();
        Config::from_fn(move |p| read(p).map(&f))
    }

    /// Use `default` when the value is missing. Invalid values still fail.
    pub fn with_default(&self, default: T) -> Config<T>
    where
        T: Clone + Sync,
    {
        let read = self.read.clone();
        Config::from_fn(move |p| match read(p) {
            Err(ConfigError::Missing { .. }) => Ok(default.clone()),
            other => other,
        })
    }

    pub fn optional(&self) -> Config<Option<T>> {
        let read = self.read.clone();
        Config::from_fn(move |p| match read(p) {
            Ok(v) => Ok(Some(v)),
            Err(ConfigError::Missing { .. }) => Ok(None),
            Err(e) => Err(e),
        })
    }

    /// Read from the fiber's provider, environment variables by default.
    pub fn load<E: Data + From<ConfigError>>(&self) -> Effect<T, E> {
        let read = self.read.clone();
        Effect::from_fn(move || {
            let read = read.clone();
            Instr::with_fiber(move |st| {
                let provider = st
                    .context
                    .get::<Arc<dyn ConfigProvider>>()
                    .unwrap_or_else(|| Arc::new(EnvConfigProvider));
                match read(provider.as_ref()) {
                    Ok(v) => Instr::succeed(v),
                    Err(e) => Instr::Fail(crate::cause::Cause::fail(E::from(e)).erase()),
                }
            })
        })
    }
}

impl Config<String> {
    pub fn string(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::from_fn(move |p| p.load(&key).ok_or_else(|| ConfigError::Missing { key: key.clone() }))
    }
}

impl Config<i64> {
    pub fn integer(key: impl Into<String>) -> Self {
        Self::parse(key, "an integer")
    }
}

impl Config<f64> {
    pub fn number(key: impl Into<String>) -> Self {
        Self::parse(key, "a number")
    }
}

impl Config<bool> {
    /// Accepts true/false, yes/no, on/off and 1/0, case-insensitively.
    pub fn boolean(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::from_fn(move |p| {
            let raw = p.load(&key).ok_or_else(|| ConfigError::Missing { key: key.clone() })?;
            match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key: key.clone(),
                    value: raw.clone(),
                    expected: "a boolean",
                }),
            }
        })
    }
}

impl<A: Send + 'static, E: Data> Effect<A, E> {
    pub fn with_config_provider(&self, provider: impl ConfigProvider) -> Self {
        let provider: Arc<dyn ConfigProvider> = Arc::new(provider);
        self.provide_service(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn provider() -> MapConfigProvider {
        MapConfigProvider::new()
            .with("PORT", "8080")
            .with("RATIO", "0.5")
            .with("DEBUG", "Yes")
            .with("BAD", "eighty")
    }

    #[test]
    fn typed_reads() {
        let p = provider();
        assert_eq!(Config::integer("PORT").read(&p), Ok(8080));
        assert_eq!(Config::number("RATIO").read(&p), Ok(0.5));
        assert_eq!(Config::boolean("DEBUG").read(&p), Ok(true));
        assert_eq!(Config::string("PORT").map(|s| s.len()).read(&p), Ok(4));
    }

    #[test]
    fn missing_and_invalid() {
        let p = provider();
        assert_eq!(
            Config::integer("HOST").read(&p),
            Err(ConfigError::Missing { key: "HOST".into() })
        );
        assert!(matches!(
            Config::integer("BAD").read(&p),
            Err(ConfigError::Invalid { expected: "an integer", .. })
        ));
        assert_eq!(Config::integer("HOST").with_default(1).read(&p), Ok(1));
        assert_eq!(Config::integer("HOST").optional().read(&p), Ok(None));
        assert!(Config::integer("BAD").with_default(1).read(&p).is_err());
    }

    #[test]
    fn load_uses_fiber_provider() {
        let rt = Runtime::new();
        let eff: Effect<i64, ConfigError> = Config::integer("PORT").load().with_config_provider(provider());
        assert_eq!(rt.run_sync(&eff), Ok(8080));
        let missing: Effect<i64, ConfigError> =
            Config::integer("SKEIN_TEST_SURELY_UNSET").load().with_config_provider(provider());
        assert_eq!(
            rt.run_sync(&missing).unwrap_err().failure(),
            Some(&ConfigError::Missing {
                key: "SKEIN_TEST_SURELY_UNSET".into()
            })
        );
    }
}
