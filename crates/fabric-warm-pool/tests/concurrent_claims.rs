use std::collections::HashSet;
use std::sync::Arc;

use fabric_warm_pool::{ClaimRequest, PrewarmRequest, ReadyUpdate, WarmPool, WarmPoolStatus};

fn ready_entry(pool: &WarmPool, team: &str, repo: &str) -> String {
    let outcome = pool
        .create_prewarm_entry(PrewarmRequest {
            team_id: team.into(),
            user_id: format!("user-{repo}"),
            snapshot_id: "snap".into(),
            repo_url: Some(repo.into()),
            branch: Some("main".into()),
        })
        .unwrap();
    assert!(pool.mark_instance_ready(
        &outcome.id,
        ReadyUpdate {
            instance_id: format!("inst-{}", outcome.id),
            vscode_url: "https://vscode".into(),
            worker_url: "https://worker".into(),
        },
    ));
    outcome.id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn one_ready_entry_has_exactly_one_winner() {
    let pool = Arc::new(WarmPool::default());
    let id = ready_entry(&pool, "team", "https://github.com/acme/app");

    let mut handles = Vec::new();
    for n in 0..64 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.claim_instance(&ClaimRequest {
                team_id: "team".into(),
                repo_url: Some("https://github.com/acme/app".into()),
                task_run_id: format!("run-{n}"),
            })
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let entry = pool.get(&id).unwrap();
    assert_eq!(entry.status, WarmPoolStatus::Claimed);
    assert!(entry.claimed_by_task_run_id.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claims_never_share_an_instance() {
    let pool = Arc::new(WarmPool::default());
    // Distinct users so no prewarm supersedes another.
    for n in 0..10 {
        ready_entry(&pool, "team", &format!("https://github.com/acme/repo-{n}"));
    }

    let mut handles = Vec::new();
    for n in 0..40 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.claim_instance(&ClaimRequest {
                team_id: "team".into(),
                repo_url: Some(format!("https://github.com/acme/repo-{}", n % 10)),
                task_run_id: format!("run-{n}"),
            })
        }));
    }

    let mut instances = HashSet::new();
    for handle in handles {
        if let Some(claimed) = handle.await.unwrap() {
            assert!(instances.insert(claimed.instance_id), "instance claimed twice");
        }
    }
    assert_eq!(instances.len(), 10);
    assert!(pool
        .entries()
        .iter()
        .all(|entry| entry.status == WarmPoolStatus::Claimed));
}
