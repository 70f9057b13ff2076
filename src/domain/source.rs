//! Base configuration sources: option grids, explicit lists, generators

use crate::config::{value_alias, Config};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Generator of the `i`-th configuration of an infinite source.
pub type GeneratorFn = Arc<dyn Fn(usize) -> Config + Send + Sync>;

/// One named option and the values it ranges over.
#[derive(Debug, Clone, PartialEq)]
pub struct Opt {
    name: String,
    values: Vec<(Value, String)>,
}

impl Opt {
    /// Option with aliases derived from the values.
    pub fn new<V, I>(name: impl Into<String>, values: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        let values = values
            .into_iter()
            .map(|v| {
                let v = v.into();
                let alias = value_alias(&v);
                (v, alias)
            })
            .collect();
        Self {
            name: name.into(),
            values,
        }
    }

    /// Option whose values carry explicit aliases.
    pub fn aliased<V, A, I>(name: impl Into<String>, values: I) -> Self
    where
        V: Into<Value>,
        A: Into<String>,
        I: IntoIterator<Item = (V, A)>,
    {
        Self {
            name: name.into(),
            values: values
                .into_iter()
                .map(|(v, a)| (v.into(), a.into()))
                .collect(),
        }
    }

    /// Option name (dotted path).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the option has no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Clone)]
pub(crate) enum Source {
    Grid(Vec<Opt>),
    Configs(Vec<Config>),
    Generator(GeneratorFn),
    Product(Box<Source>, Box<Source>),
    Chain(Box<Source>, Box<Source>),
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grid(opts) => f.debug_tuple("Grid").field(opts).finish(),
            Self::Configs(configs) => f.debug_tuple("Configs").field(&configs.len()).finish(),
            Self::Generator(_) => f.write_str("Generator"),
            Self::Product(a, b) => f.debug_tuple("Product").field(a).field(b).finish(),
            Self::Chain(a, b) => f.debug_tuple("Chain").field(a).field(b).finish(),
        }
    }
}

impl Source {
    /// Number of base configurations, `None` when infinite.
    pub(crate) fn len(&self) -> Option<usize> {
        match self {
            Self::Grid(opts) => Some(opts.iter().map(Opt::len).product()),
            Self::Configs(configs) => Some(configs.len()),
            Self::Generator(_) => None,
            Self::Product(a, b) => Some(a.len()? * b.len()?),
            Self::Chain(a, b) => Some(a.len()? + b.len()?),
        }
    }

    /// The `i`-th base configuration.
    pub(crate) fn base(&self, i: usize) -> Option<Config> {
        match self {
            Self::Grid(opts) => {
                if i >= self.len()? {
                    return None;
                }
                // mixed radix, last option varies fastest
                let mut rest = i;
                let mut picks = Vec::with_capacity(opts.len());
                for opt in opts.iter().rev() {
                    picks.push(&opt.values[rest % opt.len()]);
                    rest /= opt.len();
                }
                let mut config = Config::new();
                for (opt, (value, alias)) in opts.iter().zip(picks.into_iter().rev()) {
                    config.set_with_alias(opt.name.clone(), value.clone(), alias.clone());
                }
                Some(config)
            }
            Self::Configs(configs) => configs.get(i).cloned(),
            Self::Generator(f) => Some(f(i)),
            Self::Product(a, b) => match (a.len(), b.len()) {
                (_, Some(0)) | (Some(0), _) => None,
                (_, Some(lb)) => Some(a.base(i / lb)?.merge(&b.base(i % lb)?)),
                (Some(la), None) => Some(a.base(i % la)?.merge(&b.base(i / la)?)),
                (None, None) => Some(a.base(i)?.merge(&b.base(i)?)),
            },
            Self::Chain(a, b) => match a.len() {
                Some(la) if i >= la => b.base(i - la),
                _ => a.base(i),
            },
        }
    }
}
