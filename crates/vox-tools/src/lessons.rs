//! Adaptive-memory loader: approved behavioral lessons appended to the
//! session's system instructions.

use std::sync::Arc;

use tracing::warn;

use vox_core::types::AgentConfigId;
use vox_db::Database;

pub const ADAPTIVE_MEMORY_HEADER: &str = "ADAPTIVE MEMORY";
const MAX_LESSONS: usize = 10;

/// Build the adaptive-memory suffix for an agent, newest lessons first.
/// Returns `None` when the agent has no approved lessons; a read failure is
/// non-fatal and also yields `None`.
pub fn load_lesson_suffix(db: &Arc<Database>, agent: &AgentConfigId) -> Option<String> {
    let lessons = match db.approved_lessons(agent, MAX_LESSONS) {
        Ok(l) => l,
        Err(e) => {
            warn!(agent = %agent, "lesson load failed, continuing without: {e}");
            return None;
        }
    };
    if lessons.is_empty() {
        return None;
    }

    let mut suffix = format!("\n\n{ADAPTIVE_MEMORY_HEADER}\nLearned guidance from past conversations:\n");
    for lesson in &lessons {
        suffix.push_str(&format!("- {}\n", lesson.improved_instruction.trim()));
    }
    Some(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_db::types::AgentLesson;

    #[test]
    fn no_lessons_means_no_suffix() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        assert!(load_lesson_suffix(&db, &AgentConfigId::from("a1")).is_none());
    }

    #[test]
    fn suffix_caps_at_ten_lessons() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let agent = AgentConfigId::from("a1");
        for i in 0..12 {
            db.insert_lesson(&AgentLesson {
                id: format!("l{i}"),
                agent_config_id: agent.clone(),
                improved_instruction: format!("Always do thing {i}."),
                status: "approved".into(),
                created_at: format!("2026-03-{:02}T00:00:00Z", i + 1),
            })
            .unwrap();
        }
        let suffix = load_lesson_suffix(&db, &agent).unwrap();
        assert!(suffix.contains(ADAPTIVE_MEMORY_HEADER));
        assert_eq!(suffix.matches("- Always do thing").count(), 10);
        // newest first
        assert!(suffix.find("thing 11").unwrap() < suffix.find("thing 2").unwrap());
    }
}
