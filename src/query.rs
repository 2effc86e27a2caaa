//! View query options and their wire rendering.

use serde_json::Value as JsonValue;

/// Whether rows carry the full document body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Select {
    #[default]
    All,
    /// Keys and values only.
    Keys,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

impl From<&str> for Order {
    /// `desc` and `descending` (any case) mean descending; anything else
    /// ascending.
    fn from(order: &str) -> Self {
        match order.to_ascii_lowercase().as_str() {
            "desc" | "descending" => Order::Descending,
            _ => Order::Ascending,
        }
    }
}

/// Options accepted by [`DesignDocument::query`](crate::DesignDocument::query)
/// and friends.
///
/// ```rust
/// use couch_odm::QueryOptions;
///
/// let options = QueryOptions::new().range(2, 4).descending().limit(10);
/// assert_eq!(
///     options.to_query_string(),
///     "include_docs=true&limit=10&descending=true&startkey=4&endkey=2"
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub select: Select,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub equals: Option<JsonValue>,
    pub order: Order,
    pub range: Option<(JsonValue, JsonValue)>,
    pub reduce: Option<bool>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, select: Select) -> Self {
        self.select = select;
        self
    }

    pub fn keys_only(self) -> Self {
        self.select(Select::Keys)
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn equals(mut self, key: impl Into<JsonValue>) -> Self {
        self.equals = Some(key.into());
        self
    }

    pub fn order(mut self, order: impl Into<Order>) -> Self {
        self.order = order.into();
        self
    }

    pub fn descending(self) -> Self {
        self.order(Order::Descending)
    }

    /// Inclusive key bounds given in ascending terms; they are swapped on the
    /// wire for descending queries.
    pub fn range(mut self, start: impl Into<JsonValue>, end: impl Into<JsonValue>) -> Self {
        self.range = Some((start.into(), end.into()));
        self
    }

    pub fn reduce(mut self, reduce: bool) -> Self {
        self.reduce = Some(reduce);
        self
    }

    pub fn includes_docs(&self) -> bool {
        self.select == Select::All && self.reduce.is_none()
    }

    /// Parameters in wire order. Key values stay JSON; encoding happens in
    /// [`paramify_url`](crate::couch_helpers::paramify_url).
    pub fn params(&self) -> Vec<(String, JsonValue)> {
        let mut params = Vec::new();
        if self.includes_docs() {
            params.push(("include_docs".to_string(), JsonValue::Bool(true)));
        }
        if let Some(offset) = self.offset {
            params.push(("skip".to_string(), offset.into()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.into()));
        }
        if let Some(key) = &self.equals {
            params.push(("key".to_string(), key.clone()));
        }
        let descending = self.order == Order::Descending;
        if descending {
            params.push(("descending".to_string(), JsonValue::Bool(true)));
        }
        if let Some((start, end)) = &self.range {
            let (start, end) = if descending { (end, start) } else { (start, end) };
            params.push(("startkey".to_string(), start.clone()));
            params.push(("endkey".to_string(), end.clone()));
        }
        if let Some(reduce) = self.reduce {
            params.push(("reduce".to_string(), JsonValue::Bool(reduce)));
        }
        params
    }

    pub fn to_query_string(&self) -> String {
        crate::couch_helpers::paramify_url("", &self.params())
            .trim_start_matches('?')
            .to_string()
    }
}
