use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::KeySet;
use super::value::Value;

/// Rules for turning loosely typed input (mostly text) into column values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conversions {
    /// Decimal separator used in numeric text. Any `.` is treated as a
    /// thousands separator when this is not `.`.
    pub decimal_separator: String,

    /// Lowercase strings read as `true`.
    pub boolean_true_strings: Vec<String>,

    /// Lowercase strings read as `false`.
    pub boolean_false_strings: Vec<String>,

    /// chrono formats tried in order for date columns.
    pub date_formats: Vec<String>,

    /// chrono formats tried in order for time columns.
    pub time_formats: Vec<String>,

    /// chrono formats tried in order for datetime columns.
    pub datetime_formats: Vec<String>,
}

impl Default for Conversions {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            decimal_separator: ".".to_string(),
            boolean_true_strings: strings(&["true", "yes", "t", "y", "1"]),
            boolean_false_strings: strings(&["false", "no", "f", "n", "0"]),
            date_formats: strings(&["%Y-%m-%d"]),
            time_formats: strings(&["%H:%M:%S", "%H:%M:%S%.f"]),
            datetime_formats: strings(&[
                "%Y-%m-%d %H:%M:%S",
                "%Y-%m-%dT%H:%M:%S",
                "%Y-%m-%dT%H:%M:%S%.f",
            ]),
        }
    }
}

/// Partial [`Conversions`]; set entries replace the underlying ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionsFix {
    pub decimal_separator: Option<String>,
    pub boolean_true_strings: Option<Vec<String>>,
    pub boolean_false_strings: Option<Vec<String>>,
    pub date_formats: Option<Vec<String>>,
    pub time_formats: Option<Vec<String>>,
    pub datetime_formats: Option<Vec<String>>,
}

impl ConversionsFix {
    /// `self` layered over `lower`.
    pub fn over(&self, lower: &ConversionsFix) -> ConversionsFix {
        ConversionsFix {
            decimal_separator: self.decimal_separator.clone().or_else(|| lower.decimal_separator.clone()),
            boolean_true_strings: self
                .boolean_true_strings
                .clone()
                .or_else(|| lower.boolean_true_strings.clone()),
            boolean_false_strings: self
                .boolean_false_strings
                .clone()
                .or_else(|| lower.boolean_false_strings.clone()),
            date_formats: self.date_formats.clone().or_else(|| lower.date_formats.clone()),
            time_formats: self.time_formats.clone().or_else(|| lower.time_formats.clone()),
            datetime_formats: self.datetime_formats.clone().or_else(|| lower.datetime_formats.clone()),
        }
    }

    pub fn apply(&self, conversions: &mut Conversions) {
        if let Some(separator) = &self.decimal_separator {
            conversions.decimal_separator = separator.clone();
        }
        if let Some(strings) = &self.boolean_true_strings {
            conversions.boolean_true_strings = strings.clone();
        }
        if let Some(strings) = &self.boolean_false_strings {
            conversions.boolean_false_strings = strings.clone();
        }
        if let Some(formats) = &self.date_formats {
            conversions.date_formats = formats.clone();
        }
        if let Some(formats) = &self.time_formats {
            conversions.time_formats = formats.clone();
        }
        if let Some(formats) = &self.datetime_formats {
            conversions.datetime_formats = formats.clone();
        }
    }
}

/// Effective per-type behaviour used while processing and persisting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeConfig {
    /// Key groups sufficient to create a record, tried in order. Empty means
    /// a record can always be created.
    pub creators: Vec<KeySet>,

    /// Key groups sufficient to look up a record, tried in order.
    pub getters: Vec<KeySet>,

    /// Never create records, only update found ones.
    pub update_only: bool,

    /// Never create or update records, only look them up.
    pub get_only: bool,

    /// A lookup may resolve to several records.
    pub allow_merge_items: bool,

    /// Several input entities may resolve to the same record.
    pub allow_multi_update: bool,

    /// Skip lookups and always create.
    pub fast_insert: bool,

    /// Values applied to missing keys before persisting. Keys are paths.
    pub defaults: BTreeMap<String, Value>,

    /// Keys set to null (or an empty collection) when missing.
    pub nullables: KeySet,

    /// Keys removed when they hold null.
    pub remove_null_fields: KeySet,

    /// Keys protected on records that were found rather than created. `None`
    /// always rewrites, `Some(true)` only fills a stored null and
    /// `Some(false)` writes on create only.
    pub norewrite_fields: BTreeMap<String, Option<bool>>,

    pub conversions: Conversions,
}

/// Override bundle for a [`TypeConfig`].
///
/// Used when registering a type and by scopes. Unset options keep the
/// underlying value; `defaults` are merged per key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFix {
    pub creators: Option<Vec<KeySet>>,
    pub getters: Option<Vec<KeySet>>,
    pub update_only: Option<bool>,
    pub get_only: Option<bool>,
    pub allow_merge_items: Option<bool>,
    pub allow_multi_update: Option<bool>,
    pub fast_insert: Option<bool>,
    pub defaults: BTreeMap<String, Value>,
    pub nullables: Option<KeySet>,
    pub remove_null_fields: Option<KeySet>,
    pub norewrite_fields: Option<BTreeMap<String, Option<bool>>>,
    pub conversions: ConversionsFix,

    /// With creator autoconfig on, merge the type's required keys into every
    /// creator group. Unset means `true`.
    pub autoinject_creators: Option<bool>,

    /// `Some(true)` adds the required-keys group to configured creators,
    /// `Some(false)` turns autoconfig off, unset autoconfigures only when no
    /// creators are configured.
    pub creators_autoconfig: Option<bool>,

    /// Same as `creators_autoconfig`, for the unique combinations.
    pub getters_autoconfig: Option<bool>,
}

impl ConfigFix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn creators<I: IntoIterator<Item = KeySet>>(mut self, groups: I) -> Self {
        self.creators = Some(groups.into_iter().collect());
        self
    }

    pub fn getters<I: IntoIterator<Item = KeySet>>(mut self, groups: I) -> Self {
        self.getters = Some(groups.into_iter().collect());
        self
    }

    pub fn update_only(mut self, value: bool) -> Self {
        self.update_only = Some(value);
        self
    }

    pub fn get_only(mut self, value: bool) -> Self {
        self.get_only = Some(value);
        self
    }

    pub fn allow_merge_items(mut self, value: bool) -> Self {
        self.allow_merge_items = Some(value);
        self
    }

    pub fn allow_multi_update(mut self, value: bool) -> Self {
        self.allow_multi_update = Some(value);
        self
    }

    pub fn fast_insert(mut self, value: bool) -> Self {
        self.fast_insert = Some(value);
        self
    }

    pub fn default_value(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.defaults.insert(path.to_string(), value.into());
        self
    }

    pub fn nullables(mut self, keys: KeySet) -> Self {
        self.nullables = Some(keys);
        self
    }

    pub fn remove_null_fields(mut self, keys: KeySet) -> Self {
        self.remove_null_fields = Some(keys);
        self
    }

    pub fn decimal_separator(mut self, separator: &str) -> Self {
        self.conversions.decimal_separator = Some(separator.to_string());
        self
    }

    pub fn date_formats<I: IntoIterator<Item = S>, S: Into<String>>(mut self, formats: I) -> Self {
        self.conversions.date_formats = Some(formats.into_iter().map(Into::into).collect());
        self
    }

    pub fn datetime_formats<I: IntoIterator<Item = S>, S: Into<String>>(mut self, formats: I) -> Self {
        self.conversions.datetime_formats = Some(formats.into_iter().map(Into::into).collect());
        self
    }

    /// Protects `key` on found records; see [`TypeConfig::norewrite_fields`].
    pub fn norewrite(mut self, key: &str, rewrite_null: Option<bool>) -> Self {
        self.norewrite_fields
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), rewrite_null);
        self
    }

    pub fn autoinject_creators(mut self, value: bool) -> Self {
        self.autoinject_creators = Some(value);
        self
    }

    pub fn creators_autoconfig(mut self, value: bool) -> Self {
        self.creators_autoconfig = Some(value);
        self
    }

    pub fn getters_autoconfig(mut self, value: bool) -> Self {
        self.getters_autoconfig = Some(value);
        self
    }

    /// `self` layered over `lower`: set options win, defaults merge per key.
    pub fn over(&self, lower: &ConfigFix) -> ConfigFix {
        let mut defaults = lower.defaults.clone();
        defaults.extend(self.defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
        ConfigFix {
            creators: self.creators.clone().or_else(|| lower.creators.clone()),
            getters: self.getters.clone().or_else(|| lower.getters.clone()),
            update_only: self.update_only.or(lower.update_only),
            get_only: self.get_only.or(lower.get_only),
            allow_merge_items: self.allow_merge_items.or(lower.allow_merge_items),
            allow_multi_update: self.allow_multi_update.or(lower.allow_multi_update),
            fast_insert: self.fast_insert.or(lower.fast_insert),
            defaults,
            nullables: self.nullables.clone().or_else(|| lower.nullables.clone()),
            remove_null_fields: self
                .remove_null_fields
                .clone()
                .or_else(|| lower.remove_null_fields.clone()),
            norewrite_fields: self
                .norewrite_fields
                .clone()
                .or_else(|| lower.norewrite_fields.clone()),
            conversions: self.conversions.over(&lower.conversions),
            autoinject_creators: self.autoinject_creators.or(lower.autoinject_creators),
            creators_autoconfig: self.creators_autoconfig.or(lower.creators_autoconfig),
            getters_autoconfig: self.getters_autoconfig.or(lower.getters_autoconfig),
        }
    }

    /// Writes the set options into `config`. Autoconfig flags need the
    /// type's keys and are handled by the type itself.
    pub fn apply(&self, config: &mut TypeConfig) {
        if let Some(creators) = &self.creators {
            config.creators = creators.clone();
        }
        if let Some(getters) = &self.getters {
            config.getters = getters.clone();
        }
        if let Some(value) = self.update_only {
            config.update_only = value;
        }
        if let Some(value) = self.get_only {
            config.get_only = value;
        }
        if let Some(value) = self.allow_merge_items {
            config.allow_merge_items = value;
        }
        if let Some(value) = self.allow_multi_update {
            config.allow_multi_update = value;
        }
        if let Some(value) = self.fast_insert {
            config.fast_insert = value;
        }
        config
            .defaults
            .extend(self.defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(keys) = &self.nullables {
            config.nullables = keys.clone();
        }
        if let Some(keys) = &self.remove_null_fields {
            config.remove_null_fields = keys.clone();
        }
        if let Some(fields) = &self.norewrite_fields {
            config.norewrite_fields = fields.clone();
        }
        self.conversions.apply(&mut config.conversions);
    }
}

/// Options of a single persist call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Apply defaults, nullables and conversions before resolving.
    pub process_items: bool,

    /// Build the flat snapshot passed to `before_persist` subscribers.
    pub snapshot_before_persist: bool,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            process_items: true,
            snapshot_before_persist: true,
        }
    }
}

impl PersistConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_items(mut self, value: bool) -> Self {
        self.process_items = value;
        self
    }

    pub fn snapshot_before_persist(mut self, value: bool) -> Self {
        self.snapshot_before_persist = value;
        self
    }

    /// Parses a JSON document such as `{"process_items": false}`.
    pub fn from_json(text: &str) -> std::result::Result<Self, String> {
        serde_json::from_str(text).map_err(|e| format!("Invalid persist config: {}", e))
    }
}
