//! Apply scenarios: a completed run's diff applied onto a real git working
//! tree, with and without base-revision divergence.

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

use voratiq_core::model::{
    AgentId, AgentInvocationRecord, ArtifactCapture, InvocationStatus, RunRecord, SessionId,
    SessionRecord, SessionStatus,
};
use voratiq_core::paths::{self, Domain};
use voratiq_core::store::RecordStore;

fn run_git(dir: &Path, args: &[&str]) -> Output {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(out.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&out.stderr));
    out
}

fn voratiq_in(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_voratiq"))
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run voratiq")
}

/// Create a git repo with one committed file and an initialized `.voratiq/`
/// tree, returning the temp dir and the base commit's sha.
fn setup_repo() -> (TempDir, String) {
    let dir = TempDir::new().expect("failed to create temp dir");
    run_git(dir.path(), &["init", "--initial-branch=main"]);
    run_git(dir.path(), &["config", "user.email", "test@example.com"]);
    run_git(dir.path(), &["config", "user.name", "Test"]);

    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/artifact.ts"), "console.log('hello');\n").unwrap();
    run_git(dir.path(), &["add", "."]);
    run_git(dir.path(), &["commit", "-m", "initial"]);
    let base = String::from_utf8(run_git(dir.path(), &["rev-parse", "HEAD"]).stdout)
        .unwrap()
        .trim()
        .to_owned();

    let out = voratiq_in(dir.path(), &["init", "--preset", "manual", "-y"]);
    assert!(out.status.success(), "voratiq init failed: {}", String::from_utf8_lossy(&out.stderr));

    (dir, base)
}

/// Seed a completed run record with one agent's captured diff, ready to
/// apply.
fn seed_run(repo_root: &Path, base_revision: &str, agent: &AgentId) -> SessionId {
    let store = RecordStore::new(repo_root.to_owned(), Domain::Runs);
    let session_id = SessionId::new("20260731-090000-s1run").unwrap();

    let record = SessionRecord::Run {
        id: session_id.clone(),
        created_at: "2026-07-31T09:00:00Z".to_owned(),
        status: SessionStatus::Succeeded,
        completed_at: Some("2026-07-31T09:05:00Z".to_owned()),
        payload: RunRecord {
            base_revision: base_revision.to_owned(),
            spec_path: ".voratiq/specs/demo.md".to_owned(),
            agents: vec![AgentInvocationRecord {
                agent_id: agent.clone(),
                model: "test-model".to_owned(),
                status: InvocationStatus::Succeeded,
                started_at: Some("2026-07-31T09:00:00Z".to_owned()),
                completed_at: Some("2026-07-31T09:05:00Z".to_owned()),
                diff_stat: Some("1 file changed, 1 insertion(+), 1 deletion(-)".to_owned()),
                evals: Vec::new(),
                artifacts: ArtifactCapture {
                    stdout: true,
                    stderr: true,
                    diff: true,
                    summary: true,
                },
                warnings: Vec::new(),
                error: None,
            }],
            apply_status: None,
            deleted_at: None,
        },
    };
    store.append(record, "demo".to_owned()).unwrap();

    let artifacts_dir = repo_root
        .join(paths::agent_subdir(Domain::Runs, &session_id, agent, "artifacts").unwrap());
    std::fs::create_dir_all(&artifacts_dir).unwrap();
    std::fs::write(
        artifacts_dir.join("diff.patch"),
        "diff --git a/src/artifact.ts b/src/artifact.ts\n\
         index 0000000..1111111 100644\n\
         --- a/src/artifact.ts\n\
         +++ b/src/artifact.ts\n\
         @@ -1 +1 @@\n\
         -console.log('hello');\n\
         +console.log('hello apply');\n",
    )
    .unwrap();
    std::fs::write(artifacts_dir.join("summary.txt"), "commit subject\n").unwrap();

    session_id
}

fn read_record(repo_root: &Path, session_id: &SessionId) -> RunRecord {
    let store = RecordStore::new(repo_root.to_owned(), Domain::Runs);
    store
        .read(|r| r.id() == session_id, 1, |w| panic!("unexpected warning: {w}"))
        .into_iter()
        .find_map(|r| match r {
            SessionRecord::Run { payload, .. } => Some(payload),
            _ => None,
        })
        .expect("run record must exist")
}

/// S1: applying a run's captured diff with `--commit` updates the working
/// tree, creates exactly one commit using the captured summary as its
/// subject, and records a `succeeded` apply outcome.
#[test]
fn apply_succeeds_and_commits() {
    let (dir, base) = setup_repo();
    let agent = AgentId::new("claude".to_owned()).unwrap();
    let session_id = seed_run(dir.path(), &base, &agent);

    let out = voratiq_in(
        dir.path(),
        &["apply", "--run", session_id.as_str(), "--agent", "claude", "--commit"],
    );
    assert!(out.status.success(), "apply failed: {}", String::from_utf8_lossy(&out.stderr));

    let content = std::fs::read_to_string(dir.path().join("src/artifact.ts")).unwrap();
    assert_eq!(content, "console.log('hello apply');\n");

    let log = String::from_utf8(run_git(dir.path(), &["log", "--format=%s", "-n", "2"]).stdout).unwrap();
    let subjects: Vec<&str> = log.lines().collect();
    assert_eq!(subjects, vec!["commit subject", "initial"]);

    let payload = read_record(dir.path(), &session_id);
    let status = payload.apply_status.expect("apply_status must be recorded");
    assert_eq!(status.outcome, voratiq_core::model::ApplyOutcome::Applied);
}

/// S2: when the working tree has diverged from the run's base revision,
/// `apply` refuses unless `--ignore-base-mismatch` is passed, and records
/// the refusal either way.
#[test]
fn apply_rejects_then_accepts_base_mismatch() {
    let (dir, base) = setup_repo();
    let agent = AgentId::new("claude".to_owned()).unwrap();
    let session_id = seed_run(dir.path(), &base, &agent);

    std::fs::write(dir.path().join("README.md"), "unrelated\n").unwrap();
    run_git(dir.path(), &["add", "."]);
    run_git(dir.path(), &["commit", "-m", "unrelated advance"]);

    let out = voratiq_in(dir.path(), &["apply", "--run", session_id.as_str(), "--agent", "claude"]);
    assert!(!out.status.success(), "apply should have refused on base mismatch");

    let payload = read_record(dir.path(), &session_id);
    let status = payload.apply_status.expect("apply_status must be recorded even on refusal");
    assert_eq!(status.outcome, voratiq_core::model::ApplyOutcome::BaseMismatch);

    let content = std::fs::read_to_string(dir.path().join("src/artifact.ts")).unwrap();
    assert_eq!(content, "console.log('hello');\n", "working tree must be untouched by the refused apply");

    let out = voratiq_in(
        dir.path(),
        &["apply", "--run", session_id.as_str(), "--agent", "claude", "--ignore-base-mismatch"],
    );
    assert!(out.status.success(), "apply with --ignore-base-mismatch failed: {}", String::from_utf8_lossy(&out.stderr));

    let content = std::fs::read_to_string(dir.path().join("src/artifact.ts")).unwrap();
    assert_eq!(content, "console.log('hello apply');\n");

    let payload = read_record(dir.path(), &session_id);
    let status = payload.apply_status.expect("apply_status must be recorded");
    assert_eq!(status.outcome, voratiq_core::model::ApplyOutcome::Applied);
}
