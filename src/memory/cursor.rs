//! 游标分页：recall 与 archival 共用
//!
//! after / before 是记录 id（不透明游标），按所选排序键做开区间过滤；
//! reverse=false 返回区间内最早的 limit 条（升序），reverse=true 返回最晚的 limit 条（降序）。
//! next_cursor 为本页最后一条的 id，继续翻页时正向传 after、反向传 before，保证不会重复返回。

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::AgentError;

/// 排序键
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    #[default]
    CreatedAt,
    Id,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CursorQuery {
    pub after: Option<Uuid>,
    pub before: Option<Uuid>,
    pub limit: usize,
    #[serde(default)]
    pub order_by: OrderBy,
    #[serde(default)]
    pub reverse: bool,
}

impl Default for CursorQuery {
    fn default() -> Self {
        Self {
            after: None,
            before: None,
            limit: 50,
            order_by: OrderBy::CreatedAt,
            reverse: false,
        }
    }
}

impl CursorQuery {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn after(mut self, id: Uuid) -> Self {
        self.after = Some(id);
        self
    }

    pub fn before(mut self, id: Uuid) -> Self {
        self.before = Some(id);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CursorPage<T> {
    pub next_cursor: Option<Uuid>,
    pub records: Vec<T>,
}

/// 可参与游标分页的记录：(created_at, seq) 为时间序，id 为 id 序
pub trait CursorRecord {
    fn cursor_id(&self) -> Uuid;
    fn cursor_time(&self) -> DateTime<Utc>;
}

/// 对内存中的 (seq, record) 列表执行游标查询；seq 为插入序号，用于时间相同时的次序
pub fn paginate<T: CursorRecord + Clone>(
    records: &[(u64, T)],
    query: &CursorQuery,
) -> Result<CursorPage<T>, AgentError> {
    let mut sorted: Vec<&(u64, T)> = records.iter().collect();
    sorted.sort_by(|a, b| compare(query.order_by, a, b));

    let position = |id: Uuid| {
        sorted
            .iter()
            .position(|(_, r)| r.cursor_id() == id)
            .ok_or_else(|| AgentError::not_found("cursor", id.to_string()))
    };
    let lo = match query.after {
        Some(id) => position(id)? + 1,
        None => 0,
    };
    let hi = match query.before {
        Some(id) => position(id)?,
        None => sorted.len(),
    };
    if lo >= hi {
        return Ok(CursorPage {
            next_cursor: None,
            records: Vec::new(),
        });
    }

    let window = &sorted[lo..hi];
    let records: Vec<T> = if query.reverse {
        window
            .iter()
            .rev()
            .take(query.limit)
            .map(|(_, r)| r.clone())
            .collect()
    } else {
        window
            .iter()
            .take(query.limit)
            .map(|(_, r)| r.clone())
            .collect()
    };
    Ok(CursorPage {
        next_cursor: records.last().map(|r| r.cursor_id()),
        records,
    })
}

fn compare<T: CursorRecord>(order_by: OrderBy, a: &(u64, T), b: &(u64, T)) -> Ordering {
    match order_by {
        OrderBy::CreatedAt => a
            .1
            .cursor_time()
            .cmp(&b.1.cursor_time())
            .then(a.0.cmp(&b.0)),
        OrderBy::Id => a.1.cursor_id().cmp(&b.1.cursor_id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[derive(Clone, Debug)]
    struct Rec {
        id: Uuid,
        at: DateTime<Utc>,
    }

    impl CursorRecord for Rec {
        fn cursor_id(&self) -> Uuid {
            self.id
        }
        fn cursor_time(&self) -> DateTime<Utc> {
            self.at
        }
    }

    fn records(n: usize) -> Vec<(u64, Rec)> {
        let base = Utc::now();
        (0..n)
            .map(|i| {
                (
                    i as u64,
                    Rec {
                        id: Uuid::new_v4(),
                        at: base + Duration::milliseconds(i as i64),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_forward_pages_are_monotonic() {
        let recs = records(7);
        let mut seen = Vec::new();
        let mut q = CursorQuery::limit(3);
        loop {
            let page = paginate(&recs, &q).unwrap();
            if page.records.is_empty() {
                break;
            }
            seen.extend(page.records.iter().map(|r| r.id));
            q = CursorQuery::limit(3).after(page.next_cursor.unwrap());
        }
        let expected: Vec<Uuid> = recs.iter().map(|(_, r)| r.id).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_reverse_pages_are_monotonic() {
        let recs = records(5);
        let first = paginate(&recs, &CursorQuery::limit(2).reversed()).unwrap();
        assert_eq!(first.records[0].id, recs[4].1.id);
        assert_eq!(first.records[1].id, recs[3].1.id);
        let second = paginate(
            &recs,
            &CursorQuery::limit(2).reversed().before(first.next_cursor.unwrap()),
        )
        .unwrap();
        assert_eq!(second.records[0].id, recs[2].1.id);
        assert_eq!(second.records[1].id, recs[1].1.id);
    }

    #[test]
    fn test_ties_broken_by_sequence() {
        let at = Utc::now();
        let recs: Vec<(u64, Rec)> = (0..3)
            .map(|i| (i, Rec { id: Uuid::new_v4(), at }))
            .collect();
        let page = paginate(&recs, &CursorQuery::limit(10)).unwrap();
        let ids: Vec<Uuid> = page.records.iter().map(|r| r.id).collect();
        let expected: Vec<Uuid> = recs.iter().map(|(_, r)| r.id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_unknown_cursor_is_not_found() {
        let recs = records(2);
        let err = paginate(&recs, &CursorQuery::limit(2).after(Uuid::new_v4())).unwrap_err();
        assert!(matches!(err, AgentError::NotFound { .. }));
    }
}
