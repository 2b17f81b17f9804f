use strsim::jaro_winkler;

/// Category assigned when nothing matches.
pub const FALLBACK_CATEGORY: &str = "other";

/// Minimum Jaro-Winkler score for a whole-word fuzzy match ("poultrey" vs "poultry").
pub const MIN_CATEGORY_SIMILARITY: f64 = 0.90;

#[derive(Debug, Clone)]
struct CategoryRule {
    keyword: String,
    category: String,
}

/// Ordered keyword table translating provider category names into unified
/// inventory categories. First match wins.
#[derive(Debug, Default, Clone)]
pub struct CategoryMapper {
    rules: Vec<CategoryRule>,
}

impl CategoryMapper {
    pub fn with_defaults() -> Self {
        let mut mapper = Self::default();
        // Alcohol ahead of beverages so "wine drinks" lands in alcohol.
        for (category, keywords) in [
            ("alcohol", &["beer", "wine", "spirit", "liquor", "cocktail", "alcohol"][..]),
            ("beverages", &["beverage", "drink", "coffee", "tea", "juice", "soda"][..]),
            ("produce", &["produce", "vegetable", "fruit", "herb", "salad"][..]),
            ("protein", &["meat", "poultry", "chicken", "beef", "pork", "seafood", "fish", "protein"][..]),
            ("dairy", &["dairy", "cheese", "milk", "cream", "egg"][..]),
            ("bakery", &["bakery", "bread", "pastry", "dessert"][..]),
            ("dry_goods", &["dry", "pantry", "grain", "spice", "sauce", "condiment"][..]),
            ("supplies", &["packaging", "supply", "supplies", "disposable", "cleaning"][..]),
        ] {
            for keyword in keywords {
                mapper = mapper.register(*keyword, category);
            }
        }
        mapper
    }

    /// Append a rule. Rules registered later lose to earlier ones.
    pub fn register(mut self, keyword: impl Into<String>, category: impl Into<String>) -> Self {
        self.rules.push(CategoryRule {
            keyword: keyword.into().to_ascii_lowercase(),
            category: category.into(),
        });
        self
    }

    /// Map a provider category name. `None` or an unknown name yields [`FALLBACK_CATEGORY`].
    pub fn map(&self, provider_category: Option<&str>) -> String {
        let Some(raw) = provider_category.map(str::trim).filter(|s| !s.is_empty()) else {
            return FALLBACK_CATEGORY.to_string();
        };
        let lowered = raw.to_ascii_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        if let Some(rule) = self.rules.iter().find(|r| {
            words
                .iter()
                .any(|w| *w == r.keyword || w.strip_suffix('s') == Some(r.keyword.as_str()))
        }) {
            return rule.category.clone();
        }
        self.rules
            .iter()
            .find(|r| {
                words
                    .iter()
                    .any(|w| jaro_winkler(w, &r.keyword) >= MIN_CATEGORY_SIMILARITY)
            })
            .map(|r| r.category.clone())
            .unwrap_or_else(|| FALLBACK_CATEGORY.to_string())
    }
}
