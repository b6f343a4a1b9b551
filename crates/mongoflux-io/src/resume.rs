//! Resume position persistence.
//!
//! Positions live in the pipeline's internal database on the source server,
//! written with the same client used for tailing. Two exclusive strategies:
//! a single high-water timestamp per resume name, or one opaque token per
//! (resume name, stream).

use std::collections::HashMap;

use anyhow::{Context, Result};
use futures::StreamExt;
use mongodb::bson::{doc, Bson, Document, Timestamp};
use mongodb::options::{Acknowledgment, DatabaseOptions, WriteConcern};
use mongodb::{Client, Database};

use mongoflux_core::{ResumeStrategy, Settings, INTERNAL_DB, RESUME_COLLECTION, TOKEN_COLLECTION};

/// Where the change tail starts.
#[derive(Debug, Clone)]
pub enum ResumePoint {
    /// Start at the source's current head.
    Head,
    /// Start at (or just past) a source timestamp.
    Timestamp(Timestamp),
    /// Start each stream at its stored token; streams without one start at
    /// the head.
    Tokens(HashMap<String, Bson>),
}

pub struct ResumeStore {
    db: Database,
    resume_name: String,
}

impl ResumeStore {
    /// `unsafe_writes` relaxes the write acknowledgement level, trading
    /// durability of the position for speed.
    pub fn new(client: &Client, resume_name: &str, unsafe_writes: bool) -> Self {
        let db = if unsafe_writes {
            let options = DatabaseOptions::builder()
                .write_concern(Some(
                    WriteConcern::builder()
                        .w(Some(Acknowledgment::Nodes(0)))
                        .build(),
                ))
                .build();
            client.database_with_options(INTERNAL_DB, options)
        } else {
            client.database(INTERNAL_DB)
        };
        Self {
            db,
            resume_name: resume_name.to_string(),
        }
    }

    pub async fn load_timestamp(&self) -> Result<Option<Timestamp>> {
        let found = self
            .db
            .collection::<Document>(RESUME_COLLECTION)
            .find_one(doc! {"_id": &self.resume_name})
            .await
            .context("loading resume timestamp")?;
        Ok(found.and_then(|d| d.get("ts").and_then(Bson::as_timestamp)))
    }

    pub async fn save_timestamp(&self, ts: Timestamp) -> Result<()> {
        self.db
            .collection::<Document>(RESUME_COLLECTION)
            .replace_one(
                doc! {"_id": &self.resume_name},
                doc! {"_id": &self.resume_name, "ts": ts},
            )
            .upsert(true)
            .await
            .context("saving resume timestamp")?;
        Ok(())
    }

    pub async fn load_tokens(&self) -> Result<HashMap<String, Bson>> {
        let mut cursor = self
            .db
            .collection::<Document>(TOKEN_COLLECTION)
            .find(doc! {"resume_name": &self.resume_name})
            .await
            .context("loading resume tokens")?;
        let mut tokens = HashMap::new();
        while let Some(entry) = cursor.next().await {
            let entry = entry.context("reading resume token")?;
            if let (Ok(stream_id), Some(token)) = (entry.get_str("stream_id"), entry.get("token")) {
                tokens.insert(stream_id.to_string(), token.clone());
            }
        }
        Ok(tokens)
    }

    pub async fn save_tokens(&self, tokens: &HashMap<String, Bson>) -> Result<()> {
        let coll = self.db.collection::<Document>(TOKEN_COLLECTION);
        for (stream_id, token) in tokens {
            coll.update_one(
                doc! {"resume_name": &self.resume_name, "stream_id": stream_id},
                doc! {"$set": {"token": token.clone()}},
            )
            .upsert(true)
            .await
            .with_context(|| format!("saving resume token for {stream_id}"))?;
        }
        Ok(())
    }
}

/// The first position not yet covered by a stored timestamp: same second,
/// next ordinal.
pub fn next_after(ts: Timestamp) -> Timestamp {
    Timestamp {
        time: ts.time,
        increment: ts.increment.wrapping_add(1),
    }
}

/// Compute where this run's change tail starts, per the resume settings.
pub async fn resolve_resume_point(store: &ResumeStore, settings: &Settings) -> Result<ResumePoint> {
    match settings.resume_strategy {
        ResumeStrategy::Timestamp => {
            if let Some(secs) = settings.resume_from_timestamp {
                let time = u32::try_from(secs)
                    .with_context(|| format!("resume-from-timestamp {secs} out of range"))?;
                return Ok(ResumePoint::Timestamp(Timestamp { time, increment: 0 }));
            }
            if settings.replay {
                return Ok(ResumePoint::Timestamp(Timestamp {
                    time: 0,
                    increment: 0,
                }));
            }
            if settings.resume {
                return Ok(match store.load_timestamp().await? {
                    Some(ts) => ResumePoint::Timestamp(next_after(ts)),
                    None => ResumePoint::Head,
                });
            }
            Ok(ResumePoint::Head)
        }
        ResumeStrategy::Token => {
            if settings.resume {
                Ok(ResumePoint::Tokens(store.load_tokens().await?))
            } else {
                Ok(ResumePoint::Head)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_after_advances_the_ordinal_only() {
        let stored = Timestamp {
            time: 1_700_000_000,
            increment: 4,
        };
        let next = next_after(stored);
        assert_eq!(next.time, 1_700_000_000);
        assert_eq!(next.increment, 5);
    }
}
