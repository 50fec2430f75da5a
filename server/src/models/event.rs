use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub uuid: Uuid,
    pub name: String,
    pub slug: String,
    pub start_time: DateTime<Utc>,
    pub max_capacity: i32,
    pub max_per_user: i32,
    pub published: bool,
    /// Products offered for this event.
    pub product_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl Into<String>, start_time: DateTime<Utc>, max_capacity: i32) -> Self {
        let name = name.into();
        let slug = slugify(&format!("{} {}", name, start_time.format("%y%m%d-%H%M")));
        Self {
            uuid: Uuid::new_v4(),
            name,
            slug,
            start_time,
            max_capacity,
            max_per_user: 10,
            published: true,
            product_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// True once the number of presentable tickets reaches capacity.
    pub fn is_full(&self, active_tickets: i64) -> bool {
        active_tickets >= i64::from(self.max_capacity)
    }
}

/// ASCII slug; accented letters lose their accent.
fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut last_dash = true;
    let folded = value.nfkd().filter(|c| !is_combining_mark(*c));
    for c in folded.flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
