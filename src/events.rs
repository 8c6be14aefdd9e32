//! Serializable event stream published by the orchestrator. Consumed in this crate only
//! by the CLI binary (printed to stdout as JSON lines); the HTTP/WebSocket surface it is
//! also meant to feed lives outside this crate and needs nothing more than `PipelineEvent`
//! implementing `Serialize`.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    #[serde(rename = "chapter.crawled")]
    ChapterCrawled { index: u32, title_source: String },
    #[serde(rename = "chapter.translated")]
    ChapterTranslated { index: u32, chunk_count: usize },
    #[serde(rename = "chapter.error")]
    ChapterError { index: u32, reason: String },
    #[serde(rename = "worker.status")]
    WorkerStatus { worker_id: u32, tag: String },
    #[serde(rename = "glossary.updated")]
    GlossaryUpdated { version: u64, entry_count: usize },
    Progress {
        pending: usize,
        crawled: usize,
        translated: usize,
        error: usize,
        glossary_entry_count: usize,
    },
    Done { all_done: bool, cancelled: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_crawled_serializes_with_dotted_event_name() {
        let event = PipelineEvent::ChapterCrawled {
            index: 3,
            title_source: "第三章".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"chapter.crawled\""));
        assert!(json.contains("\"index\":3"));
    }

    #[test]
    fn done_event_round_trips_fields() {
        let event = PipelineEvent::Done {
            all_done: true,
            cancelled: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"all_done\":true"));
    }
}
