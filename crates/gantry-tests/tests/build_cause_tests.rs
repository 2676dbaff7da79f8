//! Build-cause resolution through the scheduling service.

use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use gantry_core::build_cause::{BuildCause, ScheduleOptions};
use gantry_core::config::{LockBehavior, PipelineConfig, StageConfig};
use gantry_core::outcome::{RejectReason, SkipReason};
use gantry_core::ports::PipelineRepository;
use gantry_tests::TestContext;
use gantry_tests::fixtures::{dependent, document, git, nightly, single_stage, two_stage, upstream};

fn revisions(cause: &BuildCause) -> Vec<&str> {
    cause
        .revisions()
        .iter()
        .filter_map(|r| r.latest_revision())
        .collect()
}

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
}

#[tokio::test]
async fn test_each_checkin_triggers_once() {
    let g1 = git("g1");
    let ctx = TestContext::new(document(vec![single_stage("p1", g1.clone())])).unwrap();
    ctx.checkin(&g1, "g_1").await.unwrap();

    let first = ctx.service.auto_schedule("p1").await.unwrap();
    let revision = first.scheduled().unwrap().revisions().iter().next().unwrap();
    assert_eq!(revision.latest_revision(), Some("g_1"));
    assert!(revision.changed);

    let p1 = ctx.create_pending("p1").await.unwrap().unwrap();
    ctx.pass_stage("p1", p1.counter, "dev").await.unwrap();

    let again = ctx.service.auto_schedule("p1").await.unwrap();
    assert_eq!(again.skip_reason(), Some(&SkipReason::NoChanges));

    ctx.checkin(&g1, "g_2").await.unwrap();
    let second = ctx.service.auto_schedule("p1").await.unwrap();
    let revision = second.scheduled().unwrap().revisions().iter().next().unwrap();
    assert_eq!(revision.latest_revision(), Some("g_2"));
    assert!(revision.changed);
}

#[tokio::test]
async fn test_ignored_upstream_alone_does_not_trigger() {
    let (mingle_git, go_git) = (git("mingle"), git("go"));
    let down = PipelineConfig::new("down")
        .with_material(upstream("mingle").ignored_for_scheduling())
        .with_material(upstream("go"))
        .with_stage(StageConfig::new("deploy", &["ship"]));
    let ctx = TestContext::new(document(vec![
        single_stage("mingle", mingle_git.clone()),
        single_stage("go", go_git.clone()),
        down,
    ]))
    .unwrap();

    for (name, material) in [("mingle", &mingle_git), ("go", &go_git)] {
        ctx.checkin(material, &format!("{}_1", name)).await.unwrap();
        let instance = ctx.schedule(name).await.unwrap().unwrap();
        ctx.pass_stage(name, instance.counter, "dev").await.unwrap();
    }
    let first = ctx.create_pending("down").await.unwrap().unwrap();
    assert_eq!(revisions(&first.build_cause), vec!["mingle/1/dev/1", "go/1/dev/1"]);

    // A new mingle run on its own is not enough.
    ctx.checkin(&mingle_git, "mingle_2").await.unwrap();
    let mingle = ctx.schedule("mingle").await.unwrap().unwrap();
    ctx.pass_stage("mingle", mingle.counter, "dev").await.unwrap();
    assert!(!ctx.service.queue().has_build_cause("down").await);
    let outcome = ctx.service.auto_schedule("down").await.unwrap();
    assert_eq!(outcome.skip_reason(), Some(&SkipReason::NoChanges));

    // Once go changes too, the ignored material's latest revision rides along.
    ctx.checkin(&go_git, "go_2").await.unwrap();
    let go = ctx.schedule("go").await.unwrap().unwrap();
    ctx.pass_stage("go", go.counter, "dev").await.unwrap();
    let second = ctx.create_pending("down").await.unwrap().unwrap();
    assert_eq!(second.counter, 2);
    assert_eq!(revisions(&second.build_cause), vec!["mingle/2/dev/1", "go/2/dev/1"]);
}

#[tokio::test]
async fn test_diamond_waits_for_a_consistent_upstream() {
    let u = git("u");
    let middle = |name: &str| {
        PipelineConfig::new(name)
            .with_material(upstream("up"))
            .with_stage(StageConfig::new("dev", &["unit"]))
    };
    let ctx = TestContext::new(document(vec![
        single_stage("up", u.clone()),
        middle("c1"),
        middle("c2"),
        dependent("down", &["c1", "c2"]),
    ]))
    .unwrap();

    ctx.checkin(&u, "u_1").await.unwrap();
    ctx.schedule("up").await.unwrap().unwrap();
    ctx.pass_stage("up", 1, "dev").await.unwrap();
    assert_eq!(ctx.service.schedule_pending().await.unwrap().len(), 2);

    ctx.pass_stage("c1", 1, "dev").await.unwrap();
    assert!(!ctx.service.queue().has_build_cause("down").await);
    ctx.pass_stage("c2", 1, "dev").await.unwrap();
    let first = ctx.create_pending("down").await.unwrap().unwrap();
    assert_eq!(revisions(&first.build_cause), vec!["c1/1/dev/1", "c2/1/dev/1"]);

    ctx.checkin(&u, "u_2").await.unwrap();
    ctx.schedule("up").await.unwrap().unwrap();
    ctx.pass_stage("up", 2, "dev").await.unwrap();
    assert_eq!(ctx.service.schedule_pending().await.unwrap().len(), 2);

    // c1/2 is built from up/2 but c2 only from up/1: nothing new to run with.
    ctx.pass_stage("c1", 2, "dev").await.unwrap();
    assert!(!ctx.service.queue().has_build_cause("down").await);

    ctx.pass_stage("c2", 2, "dev").await.unwrap();
    let second = ctx.create_pending("down").await.unwrap().unwrap();
    assert_eq!(revisions(&second.build_cause), vec!["c1/2/dev/1", "c2/2/dev/1"]);
}

#[tokio::test]
async fn test_timer_runs_once_per_material_set() {
    let n = git("n");
    let ctx = TestContext::new(document(vec![nightly("nightly", n.clone(), true)])).unwrap();
    ctx.checkin(&n, "n_1").await.unwrap();

    assert!(ctx.service.fire_due_timers(at(1, 21)).await.unwrap().is_empty());
    assert_eq!(
        ctx.service.fire_due_timers(at(1, 22)).await.unwrap(),
        vec!["nightly"]
    );
    let first = ctx.create_pending("nightly").await.unwrap().unwrap();
    assert!(!first.build_cause.is_forced());

    // Same materials the next night.
    assert!(ctx.service.fire_due_timers(at(2, 22)).await.unwrap().is_empty());
    assert!(!ctx.service.queue().has_build_cause("nightly").await);

    ctx.checkin(&n, "n_2").await.unwrap();
    assert_eq!(
        ctx.service.fire_due_timers(at(3, 22)).await.unwrap(),
        vec!["nightly"]
    );
    let second = ctx.create_pending("nightly").await.unwrap().unwrap();
    assert_eq!(second.counter, 2);
    assert_eq!(revisions(&second.build_cause), vec!["n_2"]);
}

#[tokio::test]
async fn test_lenient_timer_reruns_same_materials() {
    let n = git("n");
    let ctx = TestContext::new(document(vec![nightly("nightly", n.clone(), false)])).unwrap();
    ctx.checkin(&n, "n_1").await.unwrap();

    ctx.service.fire_due_timers(at(1, 21)).await.unwrap();
    for day in 1..=2 {
        assert_eq!(
            ctx.service.fire_due_timers(at(day, 22)).await.unwrap(),
            vec!["nightly"]
        );
        ctx.create_pending("nightly").await.unwrap().unwrap();
    }
    assert_eq!(ctx.repo.pipeline_count().await, 2);
}

#[tokio::test]
async fn test_concurrent_triggers_keep_one_pending() {
    let g1 = git("g1");
    let ctx = TestContext::new(document(vec![single_stage("p1", g1.clone())])).unwrap();
    ctx.checkin(&g1, "g_1").await.unwrap();

    let attempts = (0..16).map(|i| {
        let service = ctx.service.clone();
        async move {
            if i % 2 == 0 {
                service
                    .manual_schedule("p1", "alice", &ScheduleOptions::default())
                    .await
            } else {
                service.auto_schedule("p1").await
            }
        }
    });
    let observer = async {
        for _ in 0..64 {
            assert!(ctx.service.queue().len().await <= 1);
            tokio::task::yield_now().await;
        }
    };
    let (outcomes, _) = tokio::join!(join_all(attempts), observer);

    let outcomes: Vec<_> = outcomes.into_iter().map(Result::unwrap).collect();
    assert_eq!(outcomes.iter().filter(|o| o.is_scheduled()).count(), 1);
    assert!(outcomes.iter().all(|o| o.is_scheduled()
        || o.skip_reason() == Some(&SkipReason::AlreadyPending)
        || matches!(o.rejection(), Some(RejectReason::AlreadyPending { .. }))));
    assert_eq!(ctx.service.queue().len().await, 1);
}

#[tokio::test]
async fn test_locked_pipeline_waits_for_unlock() {
    let g1 = git("g1");
    let config = two_stage("locked", g1.clone()).with_lock(LockBehavior::LockOnFailure);
    let ctx = TestContext::new(document(vec![config])).unwrap();
    ctx.checkin(&g1, "g_1").await.unwrap();
    ctx.schedule("locked").await.unwrap().unwrap();
    assert_eq!(ctx.repo.lock_owner("locked").await.unwrap(), Some(1));

    ctx.checkin(&g1, "g_2").await.unwrap();
    let outcome = ctx.service.auto_schedule("locked").await.unwrap();
    assert_eq!(
        outcome.rejection().unwrap().to_string(),
        "Pipeline locked cannot be scheduled as it is locked by the running instance locked/1."
    );

    ctx.pass_stage("locked", 1, "build").await.unwrap();
    assert_eq!(ctx.repo.lock_owner("locked").await.unwrap(), Some(1));
    ctx.pass_stage("locked", 1, "ft").await.unwrap();
    assert_eq!(ctx.repo.lock_owner("locked").await.unwrap(), None);
    assert_eq!(
        ctx.events.published_matching("pipeline.locked.unlocked").await.len(),
        1
    );

    let second = ctx.schedule("locked").await.unwrap().unwrap();
    assert_eq!(second.counter, 2);
    assert_eq!(ctx.repo.lock_owner("locked").await.unwrap(), Some(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_instantiation_of_locked_pipeline_creates_one_instance() {
    for _ in 0..20 {
        let g1 = git("g1");
        let config = two_stage("locked", g1.clone()).with_lock(LockBehavior::LockOnFailure);
        let ctx = TestContext::new(document(vec![config])).unwrap();
        ctx.checkin(&g1, "g_1").await.unwrap();
        assert!(ctx.service.auto_schedule("locked").await.unwrap().is_scheduled());

        let first = tokio::spawn({
            let service = ctx.service.clone();
            async move { service.schedule_pending().await }
        });
        let second = tokio::spawn({
            let service = ctx.service.clone();
            async move { service.schedule_pending().await }
        });
        let (first, second) = tokio::join!(first, second);
        let created = first.unwrap().unwrap().len() + second.unwrap().unwrap().len();

        assert_eq!(created, 1);
        assert_eq!(ctx.repo.pipeline_count().await, 1);
        assert_eq!(ctx.repo.lock_owner("locked").await.unwrap(), Some(1));
    }
}

#[tokio::test]
async fn test_manual_trigger_with_pegged_revision() {
    let g1 = git("g1");
    let ctx = TestContext::new(document(vec![single_stage("p1", g1.clone())])).unwrap();
    ctx.checkin(&g1, "g_1").await.unwrap();
    ctx.checkin(&g1, "g_2").await.unwrap();

    let options = ScheduleOptions::default()
        .with_revision("g1", "g_1")
        .with_variable("TARGET", "staging");
    let outcome = ctx
        .service
        .manual_schedule("p1", "alice", &options)
        .await
        .unwrap();
    let cause = outcome.scheduled().unwrap();
    assert!(cause.is_forced());
    assert_eq!(revisions(cause), vec!["g_1"]);

    let instance = ctx.create_pending("p1").await.unwrap().unwrap();
    assert_eq!(instance.build_cause.approver(), "alice");
    assert_eq!(instance.build_cause.variables()["TARGET"], "staging");
}
