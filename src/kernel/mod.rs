//! Compute kernels
//!
//! A kernel turns nonce ranges into candidate nonces. Kernels only ever talk
//! to the engine through a [`KernelInterface`]; they are built by
//! [`KernelFactory`] from `KEY[=VALUE]` options given on the command line.

use crate::interface::KernelInterface;
use crate::utils::parse_flag;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::str::FromStr;

pub mod cpu;

pub use cpu::{CpuConfig, CpuKernel};

/// Compute kernel trait
///
/// `start` is called once the connection is up; `stop` on shutdown. A
/// kernel is not restarted after `stop`.
#[async_trait]
pub trait Kernel: Send {
    /// Kernel name for logging
    fn name(&self) -> &'static str;

    /// Start mining
    async fn start(&mut self) -> Result<()>;

    /// Stop mining and release compute resources
    async fn stop(&mut self) -> Result<()>;
}

/// Raw `KEY[=VALUE]` kernel options
///
/// Keys are case-insensitive. A key given without a value counts as a set
/// boolean flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelOptions(BTreeMap<String, Option<String>>);

impl KernelOptions {
    /// Parse options of the form `KEY=VALUE` or `KEY`
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Self::default();
        for arg in args {
            let arg = arg.as_ref();
            match arg.split_once('=') {
                Some((key, value)) => options.insert(key, Some(value.to_string())),
                None => options.insert(arg, None),
            }
        }
        options
    }

    /// Set an option, replacing any previous value
    pub fn insert(&mut self, key: &str, value: Option<String>) {
        self.0.insert(key.to_ascii_uppercase(), value);
    }

    /// Option names, upper-cased
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Typed value of an option, `None` when absent
    pub fn get<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        let key = key.to_ascii_uppercase();
        match self.0.get(&key) {
            None => Ok(None),
            Some(None) => Err(Error::config(format!("Option {} expects a value", key))),
            Some(Some(raw)) => raw.trim().parse().map(Some).map_err(|_| {
                Error::config(format!(
                    "Option {} expects a value of type {}, got '{}'",
                    key,
                    std::any::type_name::<T>(),
                    raw
                ))
            }),
        }
    }

    /// Typed value of an option, or `default` when absent
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Typed value of an option that must be present
    pub fn require<T: FromStr>(&self, key: &str) -> Result<T> {
        self.get(key)?.ok_or_else(|| {
            Error::config(format!(
                "Required option {} not provided",
                key.to_ascii_uppercase()
            ))
        })
    }

    /// Boolean option; a bare key or a truthy value sets it
    pub fn flag(&self, key: &str, default: bool) -> bool {
        match self.0.get(&key.to_ascii_uppercase()) {
            None => default,
            Some(value) => parse_flag(value.as_deref()),
        }
    }
}

/// Kernel factory
pub struct KernelFactory;

impl KernelFactory {
    /// Names of the kernels that can be built
    pub fn available() -> &'static [&'static str] {
        &["cpu"]
    }

    /// Build the kernel called `name`, resolving its options up front
    pub fn create(
        name: &str,
        interface: KernelInterface,
        options: &KernelOptions,
    ) -> Result<Box<dyn Kernel>> {
        match name.to_ascii_lowercase().as_str() {
            "cpu" => {
                let config = CpuConfig::from_options(options)?;
                Ok(Box::new(CpuKernel::new(interface, config)))
            }
            other => Err(Error::config(format!(
                "Unknown kernel '{}', available: {}",
                other,
                Self::available().join(", ")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_options() {
        let options = KernelOptions::parse(["threads=4", "FastLoop", "name=a=b"]);
        assert_eq!(options.get::<usize>("THREADS").unwrap(), Some(4));
        assert!(options.flag("fastloop", false));
        assert_eq!(options.get::<String>("NAME").unwrap(), Some("a=b".to_string()));
        assert_eq!(options.keys().collect::<Vec<_>>(), vec!["FASTLOOP", "NAME", "THREADS"]);
    }

    #[test]
    fn test_typed_options() {
        let options = KernelOptions::parse(["THREADS=many", "AGGRESSION"]);
        assert_matches!(options.get::<usize>("THREADS"), Err(Error::Config { .. }));
        assert_matches!(options.get::<u32>("AGGRESSION"), Err(Error::Config { .. }));
        assert_eq!(options.get_or::<u32>("DEVICE", 0).unwrap(), 0);
    }

    #[test]
    fn test_required_option() {
        let options = KernelOptions::parse(["DEVICE=1"]);
        assert_eq!(options.require::<u32>("device").unwrap(), 1);

        let err = options.require::<u32>("PLATFORM").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: Required option PLATFORM not provided"
        );
    }

    #[test]
    fn test_flag_values() {
        let options = KernelOptions::parse(["A=yes", "B=off", "C=1", "D=T"]);
        assert!(options.flag("A", false));
        assert!(!options.flag("B", true));
        assert!(options.flag("C", false));
        assert!(options.flag("D", false));
        assert!(options.flag("MISSING", true));
        assert!(!options.flag("MISSING", false));
    }

    #[test]
    fn test_unknown_kernel() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let interface = KernelInterface::new(
            tx,
            std::sync::Arc::new(crate::logger::StatusLogger::new(false)),
            std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(10)),
            std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0)),
        );
        let result = KernelFactory::create("phatk2", interface, &KernelOptions::default());
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
