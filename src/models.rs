//! Core data models: DAOs, needs, and pollen (match) records.
//!
//! Embedding vectors are carried on the records for matching but never
//! serialized into API responses.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// A registered organization with an on-chain public address.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Dao {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub public_address: String,
    #[serde(skip_serializing)]
    pub description_embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A request for help posted by a DAO.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Need {
    pub id: i64,
    pub dao_id: i64,
    pub description: String,
    #[serde(skip_serializing)]
    pub embedding: Option<Vec<f32>>,
    /// Identifier of the need in the on-chain contract, once known.
    pub contract_need_id: Option<String>,
    pub is_fulfilled: bool,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A proposed pairing between a need and a DAO that could fulfill it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Pollen {
    pub id: i64,
    pub need_id: i64,
    pub requesting_dao_id: i64,
    pub fulfilling_dao_id: i64,
    pub collaboration_description: String,
    pub confidence_score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DaoSummary {
    pub id: i64,
    pub name: String,
    pub public_address: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NeedSummary {
    pub id: i64,
    pub description: String,
    pub is_fulfilled: bool,
}

/// A pollen row joined with both DAOs and the need it answers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PollenDetail {
    #[serde(flatten)]
    pub pollen: Pollen,
    pub requesting_dao: DaoSummary,
    pub fulfilling_dao: DaoSummary,
    pub need: NeedSummary,
}

/// Row content written by the matching engine. Conflicts on
/// `(need_id, fulfilling_dao_id)` overwrite the existing row.
#[derive(Debug, Clone, PartialEq)]
pub struct PollenUpsert {
    pub need_id: i64,
    pub requesting_dao_id: i64,
    pub fulfilling_dao_id: i64,
    pub collaboration_description: String,
    pub confidence_score: f64,
}

/// Filters for listing pollen. `dao_id` matches either side of a pairing.
///
/// An empty parameter (`?dao_id=`) is the same as leaving it out.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollenQuery {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub dao_id: Option<i64>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub need_id: Option<i64>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub min_confidence: Option<f64>,
}

/// Query strings deliver text, JSON delivers numbers; accept both.
#[derive(Deserialize)]
#[serde(untagged)]
enum Param<T> {
    Value(T),
    Text(String),
}

fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    match Option::<Param<T>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Param::Value(value)) => Ok(Some(value)),
        Some(Param::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Param::Text(text)) => text.trim().parse().map(Some).map_err(de::Error::custom),
    }
}

impl PollenQuery {
    pub fn matches(&self, pollen: &Pollen) -> bool {
        if let Some(dao_id) = self.dao_id {
            if pollen.requesting_dao_id != dao_id && pollen.fulfilling_dao_id != dao_id {
                return false;
            }
        }
        if let Some(need_id) = self.need_id {
            if pollen.need_id != need_id {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            if pollen.confidence_score < min {
                return false;
            }
        }
        true
    }
}

// ============ Inputs ============

#[derive(Debug, Clone, Deserialize)]
pub struct DaoInput {
    pub name: String,
    pub description: String,
    #[serde(alias = "publicAddress")]
    pub public_address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaoUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(alias = "publicAddress")]
    pub public_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NeedInput {
    #[serde(alias = "daoId")]
    pub dao_id: i64,
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NeedUpdate {
    pub description: Option<String>,
}

/// Field values written by the store on DAO insert.
#[derive(Debug, Clone)]
pub struct NewDao {
    pub name: String,
    pub description: String,
    pub public_address: String,
    pub description_embedding: Vec<f32>,
}

/// Field values written by the store on DAO update. `None` leaves a
/// column untouched.
#[derive(Debug, Clone, Default)]
pub struct DaoChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub public_address: Option<String>,
    pub description_embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct NewNeed {
    pub dao_id: i64,
    pub description: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct NeedChanges {
    pub description: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub contract_need_id: Option<String>,
}

// ============ Timestamps ============

/// Current time in unix milliseconds, the storage format for timestamps.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pollen(need_id: i64, requesting: i64, fulfilling: i64, score: f64) -> Pollen {
        let now = Utc::now();
        Pollen {
            id: 1,
            need_id,
            requesting_dao_id: requesting,
            fulfilling_dao_id: fulfilling,
            collaboration_description: "x".into(),
            confidence_score: score,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_query_empty_params_are_absent() {
        let q: PollenQuery = serde_json::from_value(serde_json::json!({
            "dao_id": "",
            "need_id": "5",
            "min_confidence": 0.8,
        }))
        .unwrap();
        assert_eq!(q.dao_id, None);
        assert_eq!(q.need_id, Some(5));
        assert_eq!(q.min_confidence, Some(0.8));

        let q: PollenQuery = serde_json::from_value(serde_json::json!({ "need_id": 3 })).unwrap();
        assert_eq!(q.need_id, Some(3));
        assert_eq!(q.dao_id, None);

        assert!(serde_json::from_value::<PollenQuery>(serde_json::json!({ "dao_id": "abc" })).is_err());
    }

    #[test]
    fn test_query_dao_matches_either_side() {
        let q = PollenQuery {
            dao_id: Some(7),
            ..Default::default()
        };
        assert!(q.matches(&pollen(1, 7, 2, 0.9)));
        assert!(q.matches(&pollen(1, 2, 7, 0.9)));
        assert!(!q.matches(&pollen(1, 2, 3, 0.9)));
    }

    #[test]
    fn test_query_min_confidence_inclusive() {
        let q = PollenQuery {
            min_confidence: Some(0.8),
            ..Default::default()
        };
        assert!(q.matches(&pollen(1, 1, 2, 0.8)));
        assert!(!q.matches(&pollen(1, 1, 2, 0.79)));
    }

    #[test]
    fn test_embeddings_not_serialized() {
        let now = Utc::now();
        let dao = Dao {
            id: 1,
            name: "ClimateDAO".into(),
            description: "climate".into(),
            public_address: "0x1".into(),
            description_embedding: Some(vec![0.1, 0.2]),
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_value(&dao).unwrap();
        assert!(json.get("description_embedding").is_none());
        assert_eq!(json["public_address"], "0x1");
    }

    #[test]
    fn test_millis_roundtrip() {
        let ms = 1_700_000_000_123;
        assert_eq!(from_millis(ms).timestamp_millis(), ms);
    }
}
