//! Per-meeting analysis state layered on the shared memory core.
//!
//! The repository is a thin, typed view over three namespaces:
//!
//! - `meeting_state`: one [`MeetingState`] per meeting
//! - `transcripts`: the accumulated [`TranscriptSegment`] list per meeting
//! - `analysis_results`: progress and per-analysis-type results
//!
//! Everything read-modify-write (status transitions, transcript appends,
//! progress updates) goes through `atomic_update`, so concurrent writers
//! never lose each other's changes. Plain lookups read lock-free like any
//! other memory consumer.
use crate::error::MemoryResult;
use crate::memory::SharedMemory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

/// Namespace holding one state record per meeting.
pub const NS_MEETING_STATE: &str = "meeting_state";
/// Namespace holding the transcript segment list per meeting.
pub const NS_TRANSCRIPTS: &str = "transcripts";
/// Namespace holding analysis progress and results.
pub const NS_ANALYSIS_RESULTS: &str = "analysis_results";

/// Lifecycle of a meeting analysis session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    /// Created but analysis has not started
    Created,
    /// Analysis is running
    InProgress,
    /// Analysis finished successfully
    Completed,
    /// Analysis aborted
    Failed,
}

/// State record for one meeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingState {
    /// The meeting this record belongs to
    pub meeting_id: String,
    /// Current lifecycle status
    pub status: MeetingStatus,
    /// When the meeting session was created
    pub started_at: DateTime<Utc>,
    /// When the record was last changed
    pub updated_at: DateTime<Utc>,
}

/// One utterance in a meeting transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Who spoke
    pub speaker: String,
    /// What was said
    pub text: String,
    /// When it was said
    pub timestamp: DateTime<Utc>,
}

/// Progress of an analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisProgress {
    /// The phase currently running (e.g., "summarization")
    pub phase: String,
    /// Completion in percent, 0 to 100
    pub percent_complete: f64,
}

/// Typed repository for meeting analysis state.
#[derive(Debug, Clone)]
pub struct StateRepository {
    memory: SharedMemory,
    agent_id: String,
}

impl StateRepository {
    /// Create a repository writing under the given agent id.
    pub fn new(memory: SharedMemory, agent_id: impl Into<String>) -> Self {
        Self {
            memory,
            agent_id: agent_id.into(),
        }
    }

    /// The shared memory this repository is layered on.
    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    /// Create a meeting in the `Created` state.
    ///
    /// Overwrites any existing record for the meeting id; the previous
    /// record stays in the key's version history.
    pub async fn create_meeting(&self, meeting_id: &str) -> MemoryResult<MeetingState> {
        let now = Utc::now();
        let state = MeetingState {
            meeting_id: meeting_id.to_string(),
            status: MeetingStatus::Created,
            started_at: now,
            updated_at: now,
        };

        self.memory
            .write(NS_MEETING_STATE, meeting_id, &state, &self.agent_id)
            .await?;
        Ok(state)
    }

    /// Get a meeting's state, if it exists.
    pub async fn get_meeting(&self, meeting_id: &str) -> MemoryResult<Option<MeetingState>> {
        let value = self
            .memory
            .read(NS_MEETING_STATE, meeting_id, &self.agent_id)
            .await?;
        match value {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Transition a meeting to a new status.
    ///
    /// Runs as an atomic update so two concurrent transitions cannot lose
    /// each other. A transition on an unknown meeting creates the record in
    /// the requested status.
    pub async fn set_status(
        &self,
        meeting_id: &str,
        status: MeetingStatus,
    ) -> MemoryResult<MeetingState> {
        let meeting_id = meeting_id.to_string();
        let written = self
            .memory
            .atomic_update(NS_MEETING_STATE, &meeting_id, &self.agent_id, |current| {
                let now = Utc::now();
                let mut state = current
                    .cloned()
                    .and_then(|v| serde_json::from_value::<MeetingState>(v).ok())
                    .unwrap_or(MeetingState {
                        meeting_id: meeting_id.clone(),
                        status,
                        started_at: now,
                        updated_at: now,
                    });
                state.status = status;
                state.updated_at = now;
                json!(state)
            })
            .await?;
        Ok(serde_json::from_value(written)?)
    }

    /// Append a segment to a meeting's transcript.
    ///
    /// Returns the transcript length after the append.
    pub async fn append_transcript(
        &self,
        meeting_id: &str,
        segment: TranscriptSegment,
    ) -> MemoryResult<usize> {
        let segment = json!(segment);
        let written = self
            .memory
            .atomic_update(NS_TRANSCRIPTS, meeting_id, &self.agent_id, move |current| {
                let mut segments = current
                    .and_then(|v| v.as_array().cloned())
                    .unwrap_or_default();
                segments.push(segment.clone());
                JsonValue::Array(segments)
            })
            .await?;

        Ok(written.as_array().map(|a| a.len()).unwrap_or(0))
    }

    /// The full transcript for a meeting, oldest segment first.
    pub async fn get_transcript(
        &self,
        meeting_id: &str,
    ) -> MemoryResult<Vec<TranscriptSegment>> {
        let value = self
            .memory
            .read(NS_TRANSCRIPTS, meeting_id, &self.agent_id)
            .await?;
        match value {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Record analysis progress for a meeting.
    ///
    /// Lost-update safe: concurrent progress reports each land as their own
    /// version.
    pub async fn update_progress(
        &self,
        meeting_id: &str,
        progress: AnalysisProgress,
    ) -> MemoryResult<()> {
        let progress = json!(progress);
        self.memory
            .atomic_update(
                NS_ANALYSIS_RESULTS,
                progress_key(meeting_id),
                &self.agent_id,
                move |_| progress.clone(),
            )
            .await?;
        Ok(())
    }

    /// Current analysis progress for a meeting, if any was reported.
    pub async fn get_progress(
        &self,
        meeting_id: &str,
    ) -> MemoryResult<Option<AnalysisProgress>> {
        let value = self
            .memory
            .read(NS_ANALYSIS_RESULTS, progress_key(meeting_id), &self.agent_id)
            .await?;
        match value {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Store a result for one analysis type (e.g., "summary", "sentiment").
    pub async fn store_result(
        &self,
        meeting_id: &str,
        analysis_type: &str,
        result: JsonValue,
    ) -> MemoryResult<()> {
        self.memory
            .write(
                NS_ANALYSIS_RESULTS,
                result_key(meeting_id, analysis_type),
                result,
                &self.agent_id,
            )
            .await?;
        Ok(())
    }

    /// Fetch a stored analysis result.
    pub async fn get_result(
        &self,
        meeting_id: &str,
        analysis_type: &str,
    ) -> MemoryResult<Option<JsonValue>> {
        self.memory
            .read(
                NS_ANALYSIS_RESULTS,
                result_key(meeting_id, analysis_type),
                &self.agent_id,
            )
            .await
    }

    /// Ids of meetings that are created or in progress, sorted.
    pub async fn list_active_meetings(&self) -> MemoryResult<Vec<String>> {
        let mut active = Vec::new();
        for key in self.memory.list_keys(NS_MEETING_STATE).await {
            let Some(value) = self
                .memory
                .read(NS_MEETING_STATE, &key, &self.agent_id)
                .await?
            else {
                continue;
            };
            let state: MeetingState = serde_json::from_value(value)?;
            if matches!(
                state.status,
                MeetingStatus::Created | MeetingStatus::InProgress
            ) {
                active.push(state.meeting_id);
            }
        }
        active.sort();
        Ok(active)
    }
}

fn progress_key(meeting_id: &str) -> String {
    format!("{meeting_id}/progress")
}

fn result_key(meeting_id: &str, analysis_type: &str) -> String {
    format!("{meeting_id}/{analysis_type}")
}
