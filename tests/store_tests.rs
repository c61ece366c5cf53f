use chrono::Utc;
use std::path::Path;
use tempfile::tempdir;

use sessionscribe::store::{JobStatus, JobStep, JsonStore, SessionStatus};

fn open_store(dir: &Path) -> JsonStore {
    JsonStore::open(dir.join("store.json")).unwrap()
}

#[test]
fn records_survive_reopen() {
    let dir = tempdir().unwrap();

    {
        let store = open_store(dir.path());
        let campaign = store
            .create_campaign("Curse of Strahd", None, None, vec![])
            .unwrap();
        let session = store
            .create_session(
                campaign.id,
                1,
                Utc::now(),
                "session.zip",
                Path::new("/data/input/20240309"),
            )
            .unwrap();
        store
            .create_job(session.id, JobStep::full_transcribe(), "Job queued.")
            .unwrap();
    }

    let store = open_store(dir.path());
    let campaigns = store.campaigns().unwrap();
    assert_eq!(campaigns.len(), 1);
    assert_eq!(campaigns[0].name, "Curse of Strahd");
    assert!(campaigns[0].is_default);

    let sessions = store.sessions_for_campaign(campaigns[0].id).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Uploaded);

    let jobs = store.jobs_for_session(sessions[0].id).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].step, JobStep::full_transcribe());
    assert_eq!(jobs[0].status, JobStatus::Pending);
    assert_eq!(jobs[0].logs, "Job queued.");
}

#[test]
fn pending_jobs_are_claimed_oldest_first() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let campaign = store.create_campaign("c", None, None, vec![]).unwrap();
    let session = store
        .create_session(campaign.id, 1, Utc::now(), "s.zip", Path::new("/tmp/s"))
        .unwrap();

    let first = store
        .create_job(session.id, JobStep::full_transcribe(), "Job queued.")
        .unwrap();
    let second = store
        .create_job(session.id, JobStep::Summarize, "Job queued.")
        .unwrap();

    let next = store.next_pending_job().unwrap().unwrap();
    assert_eq!(next.id, first.id);

    // Claiming flips it to processing and takes it out of the queue.
    assert!(store.claim_job(first.id).unwrap());
    assert!(!store.claim_job(first.id).unwrap());

    let next = store.next_pending_job().unwrap().unwrap();
    assert_eq!(next.id, second.id);
}

#[test]
fn orphaned_processing_jobs_reset_to_pending_with_marker() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let campaign = store.create_campaign("c", None, None, vec![]).unwrap();
    let session = store
        .create_session(campaign.id, 1, Utc::now(), "s.zip", Path::new("/tmp/s"))
        .unwrap();
    let job = store
        .create_job(session.id, JobStep::full_transcribe(), "Job queued.")
        .unwrap();

    assert!(store.claim_job(job.id).unwrap());
    assert_eq!(store.reset_orphaned_jobs().unwrap(), 1);

    let job = store.job(job.id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.logs.contains("[System Restart]"));

    // Completed jobs are untouched by recovery.
    assert!(store.claim_job(job.id).unwrap());
    store.set_job_status(job.id, JobStatus::Completed).unwrap();
    assert_eq!(store.reset_orphaned_jobs().unwrap(), 0);
}

#[test]
fn retry_requeues_job_and_reactivates_session() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let campaign = store.create_campaign("c", None, None, vec![]).unwrap();
    let session = store
        .create_session(campaign.id, 1, Utc::now(), "s.zip", Path::new("/tmp/s"))
        .unwrap();
    let job = store
        .create_job(session.id, JobStep::Summarize, "Job queued.")
        .unwrap();

    store.claim_job(job.id).unwrap();
    store.set_job_status(job.id, JobStatus::Error).unwrap();
    store
        .set_session_status(session.id, SessionStatus::Error)
        .unwrap();

    store.retry_job(job.id).unwrap();

    let job = store.job(job.id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.logs.contains("--- Retry initiated by user at"));

    let session = store.session(session.id).unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Processing);
}

#[test]
fn transcripts_upsert_by_speaker() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let campaign = store.create_campaign("c", None, None, vec![]).unwrap();
    let session = store
        .create_session(campaign.id, 1, Utc::now(), "s.zip", Path::new("/tmp/s"))
        .unwrap();

    store
        .upsert_transcript(session.id, "alice", "1-alice.flac", "first pass")
        .unwrap();
    store
        .upsert_transcript(session.id, "bob", "2-bob.flac", "bob lines")
        .unwrap();
    store
        .upsert_transcript(session.id, "alice", "1-alice.flac", "second pass")
        .unwrap();

    let rows = store.transcripts_for_session(session.id).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].speaker, "alice");
    assert_eq!(rows[0].content, "second pass");
    assert_eq!(rows[1].speaker, "bob");
}

#[test]
fn has_job_distinguishes_steps() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let campaign = store.create_campaign("c", None, None, vec![]).unwrap();
    let session = store
        .create_session(campaign.id, 1, Utc::now(), "s.zip", Path::new("/tmp/s"))
        .unwrap();

    store
        .create_job(session.id, JobStep::targeted_transcribe("alice"), "Job queued.")
        .unwrap();

    assert!(store
        .has_job(session.id, &JobStep::targeted_transcribe("alice"))
        .unwrap());
    assert!(!store.has_job(session.id, &JobStep::full_transcribe()).unwrap());
    assert!(!store.has_job(session.id, &JobStep::Summarize).unwrap());
}

#[test]
fn delete_session_cascades_but_keeps_audit_rows() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let campaign = store.create_campaign("c", None, None, vec![]).unwrap();
    let session = store
        .create_session(campaign.id, 1, Utc::now(), "s.zip", Path::new("/tmp/s"))
        .unwrap();
    store
        .create_job(session.id, JobStep::full_transcribe(), "Job queued.")
        .unwrap();
    store
        .upsert_transcript(session.id, "alice", "1-alice.flac", "text")
        .unwrap();
    store
        .record_llm_call(sessionscribe::store::NewLlmCall {
            provider: "Google".into(),
            model: "gemini-2.5-flash".into(),
            prompt_tokens: 10,
            completion_tokens: 20,
            total_tokens: 30,
            cost: 0.0,
            duration_secs: 1.0,
            http_status: 200,
            finish_reason: "STOP".into(),
            request_json: "{}".into(),
            response_json: "{}".into(),
        })
        .unwrap();

    store.delete_session(session.id).unwrap();

    assert!(store.session(session.id).unwrap().is_none());
    assert!(store.jobs_for_session(session.id).unwrap().is_empty());
    assert!(store.transcripts_for_session(session.id).unwrap().is_empty());
    assert_eq!(store.llm_calls().unwrap().len(), 1);
}
