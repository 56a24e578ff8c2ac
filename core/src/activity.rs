//! Agent activity records, the unit of ingestion.

use serde::{Deserialize, Serialize};

/// One agent action emitted by the simulation driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub platform: String,
    #[serde(default)]
    pub agent_id: i64,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub action_type: String,
    #[serde(default)]
    pub action_args: serde_json::Value,
    #[serde(rename = "round", default)]
    pub round_num: i64,
    #[serde(default)]
    pub timestamp: String,
}

impl Activity {
    /// Build an activity from a raw record as parsed from an actions stream.
    ///
    /// Records carrying an `event_type` field are meta-events, not agent
    /// actions; they yield `None` and must be ignored by ingestion.
    pub fn from_value(data: &serde_json::Value, platform: &str) -> Option<Self> {
        let obj = data.as_object()?;
        if obj.contains_key("event_type") {
            return None;
        }
        Some(Self {
            platform: platform.to_string(),
            agent_id: obj.get("agent_id").and_then(|v| v.as_i64()).unwrap_or(0),
            agent_name: obj
                .get("agent_name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            action_type: obj
                .get("action_type")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            action_args: obj
                .get("action_args")
                .cloned()
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            round_num: obj.get("round").and_then(|v| v.as_i64()).unwrap_or(0),
            timestamp: obj
                .get("timestamp")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        })
    }

    /// Render this activity as a short natural-language episode line.
    pub fn episode_text(&self) -> String {
        let actor = if self.agent_name.is_empty() {
            format!("agent {}", self.agent_id)
        } else {
            self.agent_name.clone()
        };
        let action = self.describe_action();
        format!(
            "[{} round {}] {} {}",
            self.platform, self.round_num, actor, action
        )
    }

    fn describe_action(&self) -> String {
        let args = &self.action_args;
        let text_arg = args
            .get("content")
            .or_else(|| args.get("text"))
            .and_then(|v| v.as_str());

        match self.action_type.as_str() {
            "CREATE_POST" => match text_arg {
                Some(text) => format!("posted: {}", text),
                None => "posted".to_string(),
            },
            "CREATE_COMMENT" => match text_arg {
                Some(text) => format!("commented: {}", text),
                None => "commented".to_string(),
            },
            "QUOTE_POST" => match text_arg {
                Some(text) => format!("quoted a post, saying: {}", text),
                None => "quoted a post".to_string(),
            },
            "REPOST" => "reposted a post".to_string(),
            "LIKE_POST" => "liked a post".to_string(),
            "UNLIKE_POST" => "removed a like from a post".to_string(),
            "DISLIKE_POST" => "disliked a post".to_string(),
            "LIKE_COMMENT" => "liked a comment".to_string(),
            "DISLIKE_COMMENT" => "disliked a comment".to_string(),
            "FOLLOW" => "followed another agent".to_string(),
            "UNFOLLOW" => "unfollowed another agent".to_string(),
            "MUTE" => "muted another agent".to_string(),
            "JOIN_GROUP" => "joined a group".to_string(),
            "LEAVE_GROUP" => "left a group".to_string(),
            other => {
                let compact = serde_json::to_string(args).unwrap_or_default();
                if compact == "{}" || compact.is_empty() {
                    format!("performed {}", other)
                } else {
                    format!("performed {} with {}", other, compact)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_skips_meta_events() {
        let meta = json!({"event_type": "round_start", "round": 3});
        assert!(Activity::from_value(&meta, "twitter").is_none());
    }

    #[test]
    fn from_value_builds_activity() {
        let data = json!({
            "agent_id": 7,
            "agent_name": "Alice",
            "action_type": "CREATE_POST",
            "action_args": {"content": "I like Bluesky"},
            "round": 2,
            "timestamp": "2026-01-01T00:00:00"
        });
        let activity = Activity::from_value(&data, "twitter").unwrap();
        assert_eq!(activity.agent_name, "Alice");
        assert_eq!(activity.platform, "twitter");
        assert_eq!(activity.round_num, 2);
    }

    #[test]
    fn episode_text_renders_post_content() {
        let activity = Activity {
            platform: "twitter".to_string(),
            agent_id: 1,
            agent_name: "Alice".to_string(),
            action_type: "CREATE_POST".to_string(),
            action_args: json!({"content": "I like Bluesky"}),
            round_num: 1,
            timestamp: "2026-01-01T00:00:00".to_string(),
        };
        assert_eq!(
            activity.episode_text(),
            "[twitter round 1] Alice posted: I like Bluesky"
        );
    }

    #[test]
    fn episode_text_falls_back_to_raw_action() {
        let activity = Activity {
            platform: "reddit".to_string(),
            agent_id: 4,
            agent_name: String::new(),
            action_type: "SEARCH_POSTS".to_string(),
            action_args: json!({"query": "rust"}),
            round_num: 5,
            timestamp: String::new(),
        };
        let text = activity.episode_text();
        assert!(text.starts_with("[reddit round 5] agent 4 performed SEARCH_POSTS"));
        assert!(text.contains("rust"));
    }
}
