//! Layered configuration loading.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::HashSet, path::Path};

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    value::Dict,
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tally_error::GenericError;
use tracing::debug;

mod provider;
use self::provider::ResolvedProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field's value was not of the expected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Name of the invalid field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to load configuration: {}", source))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        from_figment_error(&HashSet::new(), e)
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum LookupSource {
    /// A prefixed environment variable, such as `TALLY_POLL_INTERVAL`.
    Environment { prefix: String },

    /// An environment variable mapped directly onto a key.
    Alias { var: &'static str, key: &'static str },
}

impl LookupSource {
    fn transform_key(&self, key: &str) -> Option<String> {
        match self {
            // The prefix is already uppercased, with a trailing underscore.
            Self::Environment { prefix } => Some(format!("{}{}", prefix, key.replace('.', "_").to_uppercase())),
            Self::Alias { var, key: aliased } => (*aliased == key).then(|| var.to_string()),
        }
    }
}

struct BoxedProvider(Box<dyn Provider + Send + Sync>);

impl Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, Dict>, figment::Error> {
        self.0.data()
    }
}

/// A configuration loader that can pull from various sources.
///
/// Sources added later take precedence over sources added earlier. Once every source has been added, the merged
/// configuration is deserialized with [`into_typed`][Self::into_typed].
///
/// # Supported sources
///
/// - YAML file
/// - environment variables with a common prefix (see [`from_environment`][Self::from_environment])
/// - individual environment variables mapped onto specific keys (see
///   [`from_environment_aliases`][Self::from_environment_aliases])
/// - any serializable value, such as parsed command-line flags (see [`with_overrides`][Self::with_overrides])
#[derive(Default)]
pub struct ConfigurationLoader {
    lookup_sources: Vec<LookupSource>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid YAML, an error will be returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let resolved_provider = ResolvedProvider::from_yaml(&path)?;
        self.providers.push(BoxedProvider(Box::new(resolved_provider)));
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring any errors.
    ///
    /// Errors include the file not existing, not being readable/accessible, and not being valid YAML.
    pub fn try_from_yaml<P>(mut self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        match ResolvedProvider::from_yaml(&path) {
            Ok(resolved_provider) => {
                self.providers.push(BoxedProvider(Box::new(resolved_provider)));
            }
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to read YAML configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// The prefix given will have an underscore appended to it if it does not already end with one. For example, with a
    /// prefix of `tally`, any environment variable starting with `TALLY_` would be matched, and `TALLY_POLL_INTERVAL`
    /// would set `poll_interval`.
    ///
    /// The prefix is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, or the environment could not be read, an error will be returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // `Env` isn't `Send + Sync`, so capture its values now.
        let values = Env::prefixed(&prefix).data()?;
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(default_dict.clone()))));
        }
        self.lookup_sources.push(LookupSource::Environment { prefix });
        Ok(self)
    }

    /// Loads configuration from individual environment variables, each mapped onto a specific key.
    ///
    /// Each alias is a pair of environment variable name and configuration key, such as `("ADDRESS", "server_address")`.
    /// Variable names are matched case-insensitively. Variables that are unset, or set to an empty value, are ignored.
    ///
    /// # Errors
    ///
    /// If the environment could not be read, an error will be returned.
    pub fn from_environment_aliases(
        mut self, aliases: &[(&'static str, &'static str)],
    ) -> Result<Self, ConfigurationError> {
        let mut present = Vec::new();
        for &(var, key) in aliases {
            self.lookup_sources.push(LookupSource::Alias { var, key });

            if std::env::var(var).is_ok_and(|value| !value.trim().is_empty()) {
                debug!(var, key, "Found configuration value in environment variable.");
                present.push((var, key));
            }
        }

        if present.is_empty() {
            return Ok(self);
        }

        let env = Env::raw().filter_map(move |name| {
            present
                .iter()
                .find(|(var, _)| name.as_str().eq_ignore_ascii_case(var))
                .map(|(_, key)| (*key).into())
        });
        let values = env.data()?;
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(default_dict.clone()))));
        }
        Ok(self)
    }

    /// Overrides configuration with the fields of the given value.
    ///
    /// `value` must serialize to a map. Fields that serialize to nothing, such as `None` with
    /// `#[serde(skip_serializing_if = "Option::is_none")]`, leave the existing configuration untouched.
    pub fn with_overrides<T>(mut self, value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.providers.push(BoxedProvider(Box::new(Serialized::defaults(value))));
        self
    }

    /// Consumes the configuration loader, deserializing it as `T`.
    ///
    /// ## Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned. Missing fields are reported
    /// along with the environment variables that could have been used to set them.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let figment = self
            .providers
            .into_iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider));

        let lookup_sources = self.lookup_sources.into_iter().collect::<HashSet<_>>();
        figment.extract().map_err(|e| from_figment_error(&lookup_sources, e))
    }
}

fn from_figment_error(lookup_sources: &HashSet<LookupSource>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut valid_keys = lookup_sources
                .iter()
                .filter_map(|source| source.transform_key(&field))
                .collect::<Vec<_>>();
            valid_keys.sort();

            // The key itself is always a valid way to set it.
            valid_keys.insert(0, field.to_string());

            let help_text = format!("Try setting `{}`.", valid_keys.join("` or `"));

            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}
