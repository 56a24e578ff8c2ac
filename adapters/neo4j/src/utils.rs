//! Row-to-domain conversion helpers

use chrono::{DateTime, Utc};
use engram_core::prelude::*;
use neo4rs::Row;

pub fn parse_datetime(value: &str) -> Result<DateTime<Utc>, GraphError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GraphError::DatabaseError(format!("Invalid datetime '{}': {}", value, e)))
}

pub fn parse_optional_datetime(value: Option<String>) -> Result<Option<DateTime<Utc>>, GraphError> {
    match value {
        Some(s) if !s.is_empty() => Ok(Some(parse_datetime(&s)?)),
        _ => Ok(None),
    }
}

fn parse_attributes(json: Option<String>) -> serde_json::Value {
    json.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()))
}

fn get_string(row: &Row, key: &str) -> Result<String, GraphError> {
    row.get::<String>(key)
        .map_err(|e| GraphError::DatabaseError(format!("Missing column '{}': {}", key, e)))
}

fn get_optional_string(row: &Row, key: &str) -> Option<String> {
    row.get::<Option<String>>(key).ok().flatten()
}

pub fn entity_from_row(row: &Row) -> Result<Entity, GraphError> {
    Ok(Entity {
        uuid: get_string(row, "uuid")?,
        project_id: get_optional_string(row, "project_id").unwrap_or_default(),
        graph_id: GraphId::new(get_optional_string(row, "graph_id").unwrap_or_default()),
        name: get_optional_string(row, "name").unwrap_or_default(),
        entity_type: get_optional_string(row, "entity_type").unwrap_or_default(),
        summary: get_optional_string(row, "summary").unwrap_or_default(),
        attributes: parse_attributes(get_optional_string(row, "attributes_json")),
        source_entity_types: row
            .get::<Option<Vec<String>>>("source_entity_types")
            .ok()
            .flatten()
            .unwrap_or_default(),
        created_at: parse_datetime(&get_string(row, "created_at")?)?,
    })
}

pub fn relation_from_row(row: &Row) -> Result<Relation, GraphError> {
    let name = get_optional_string(row, "name").unwrap_or_default();
    Ok(Relation {
        uuid: get_string(row, "uuid")?,
        project_id: get_optional_string(row, "project_id").unwrap_or_default(),
        graph_id: GraphId::new(get_optional_string(row, "graph_id").unwrap_or_default()),
        source_uuid: get_string(row, "source_uuid")?,
        target_uuid: get_string(row, "target_uuid")?,
        fact: get_optional_string(row, "fact").unwrap_or_default(),
        fact_type: get_optional_string(row, "fact_type").unwrap_or_else(|| name.clone()),
        name,
        attributes: parse_attributes(get_optional_string(row, "attributes_json")),
        created_at: parse_datetime(&get_string(row, "created_at")?)?,
        valid_at: parse_datetime(&get_string(row, "valid_at")?)?,
        invalid_at: parse_optional_datetime(get_optional_string(row, "invalid_at"))?,
        expired_at: parse_optional_datetime(get_optional_string(row, "expired_at"))?,
        episodes: row
            .get::<Option<Vec<String>>>("episodes")
            .ok()
            .flatten()
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_parsing() {
        let parsed = parse_datetime("2026-01-01T00:00:00+00:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-01-01T00:00:00+00:00");
        assert!(parse_datetime("not a date").is_err());
    }

    #[test]
    fn optional_datetime_treats_empty_as_none() {
        assert_eq!(parse_optional_datetime(None).unwrap(), None);
        assert_eq!(parse_optional_datetime(Some(String::new())).unwrap(), None);
        assert!(parse_optional_datetime(Some("2026-01-01T00:00:00Z".to_string()))
            .unwrap()
            .is_some());
    }
}
