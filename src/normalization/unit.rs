use std::collections::HashMap;

pub const DEFAULT_UNIT: &str = "each";

/// Token table translating variation names and measurement-unit labels into
/// unified units ("lb", "oz", "kg", ...).
#[derive(Debug, Default, Clone)]
pub struct UnitMapper {
    aliases: HashMap<String, String>,
    /// Aliases that only count right after a quantity ("1.5 L", "2l"), so a
    /// bare size label like "L" stays a size.
    quantified: HashMap<String, String>,
}

impl UnitMapper {
    pub fn with_defaults() -> Self {
        let mut mapper = Self::default();
        for (unit, aliases) in [
            ("lb", &["lb", "lbs", "pound", "pounds"][..]),
            ("oz", &["oz", "ounce", "ounces"][..]),
            ("kg", &["kg", "kgs", "kilogram", "kilograms"][..]),
            ("g", &["g", "gram", "grams"][..]),
            ("l", &["liter", "liters", "litre", "litres"][..]),
            ("ml", &["ml", "milliliter", "milliliters"][..]),
            ("gal", &["gal", "gallon", "gallons"][..]),
            ("case", &["case", "cases", "cs"][..]),
            ("dozen", &["dozen", "dz"][..]),
            ("each", &["each", "ea", "unit", "units", "piece", "pieces", "pc", "pcs"][..]),
        ] {
            for alias in aliases {
                mapper = mapper.register(*alias, unit);
            }
        }
        mapper.quantified.insert("l".into(), "l".into());
        mapper
    }

    /// Register or override an alias. Also used for opaque provider unit ids.
    pub fn register(mut self, alias: impl Into<String>, unit: impl Into<String>) -> Self {
        self.aliases
            .insert(alias.into().to_ascii_lowercase(), unit.into());
        self
    }

    fn lookup(&self, label: &str) -> Option<&str> {
        let lowered = label.trim().to_ascii_lowercase();
        if let Some(unit) = self.aliases.get(&lowered) {
            return Some(unit.as_str());
        }
        // "Per lb", "5 lb bag", "12oz", "1.5 L"
        let mut after_quantity = false;
        let mut rest = lowered.as_str();
        while let Some(c) = rest.chars().next() {
            if c.is_ascii_alphabetic() {
                let end = rest.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(rest.len());
                let token = &rest[..end];
                if let Some(unit) = self.aliases.get(token) {
                    return Some(unit.as_str());
                }
                if after_quantity {
                    if let Some(unit) = self.quantified.get(token) {
                        return Some(unit.as_str());
                    }
                }
                after_quantity = false;
                rest = &rest[end..];
                continue;
            }
            if c.is_ascii_digit() {
                after_quantity = true;
            } else if !matches!(c, ' ' | '.' | ',') {
                after_quantity = false;
            }
            rest = &rest[c.len_utf8()..];
        }
        None
    }

    /// First label that resolves wins; falls back to [`DEFAULT_UNIT`].
    pub fn map<'a>(&self, labels: impl IntoIterator<Item = Option<&'a str>>) -> String {
        labels
            .into_iter()
            .flatten()
            .find_map(|label| self.lookup(label))
            .unwrap_or(DEFAULT_UNIT)
            .to_string()
    }
}
