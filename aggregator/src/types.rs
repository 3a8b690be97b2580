use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Upper bound on the number of items held in the aggregate.
pub const MAX_ITEMS: usize = 1000;

/// A single news item collected from a source.
///
/// The `id` is derived from the source name, the unix time of the collection
/// pass and the index of the item within that source's batch. It is unique
/// within one pass but the same upstream article gets a new id every time it
/// is collected again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    pub description: String,
    pub url: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
}

impl Item {
    pub fn collected_id(source: &str, collected_at: i64, index: usize) -> String {
        format!("{source}_{collected_at}_{index}")
    }
}

/// A polled news source.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Source {
    pub name: String,
    pub url: Url,
    /// Informational only. All sources are polled at the shared interval.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

impl Source {
    pub fn new<N>(name: N, url: Url) -> Self
    where
        N: Into<String>,
    {
        Source {
            name: name.into(),
            url,
            interval_secs: None,
        }
    }
}

/// Most recent first. Items published at the same instant are ordered by id.
pub fn sort_by_date(items: &mut [Item]) {
    items.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub fn limit_to(items: &[Item], limit: usize) -> Vec<Item> {
    items[..limit.min(items.len())].to_vec()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn item(id: &str, published_secs: i64) -> Item {
        Item {
            id: id.to_string(),
            title: format!("title {id}"),
            description: format!("description {id}"),
            url: format!("https://example.com/{id}"),
            source: "test".to_string(),
            published_at: Utc.timestamp_opt(published_secs, 0).unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::item;
    use super::*;

    #[test]
    fn test_sort_by_date_with_tie_break() {
        let mut items = vec![item("b", 100), item("c", 300), item("a", 100), item("d", 200)];
        sort_by_date(&mut items);

        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn test_limit_to() {
        let items = vec![item("a", 3), item("b", 2), item("c", 1)];
        assert_eq!(limit_to(&items, 0).len(), 0);
        assert_eq!(limit_to(&items, 2).len(), 2);
        assert_eq!(limit_to(&items, 10).len(), 3);
    }

    #[test]
    fn test_item_serialization_field_names() {
        let json = serde_json::to_value(item("x", 0)).unwrap();
        assert_eq!(json["published_at"], "1970-01-01T00:00:00Z");
        for field in ["id", "title", "description", "url", "source"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn test_collected_id() {
        assert_eq!(Item::collected_id("tech", 1640995200, 3), "tech_1640995200_3");
    }
}
