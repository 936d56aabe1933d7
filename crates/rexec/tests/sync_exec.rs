use std::time::Duration;

use rexec::error::Phase;
use rexec::hash::run_id_for;
use rexec::prelude::*;
use rexec::run_table::RunPhase;
use rexec::testing::test_broker;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn register_fleet(dispatcher: &Dispatcher, size: usize) {
    for i in 0..size {
        let request = Envelope::new(Command::Register)
            .with_actname("app")
            .with_actid(format!("dev-{i}"));
        dispatcher.handle_admin(&request).await.unwrap();
    }
}

async fn ready(dispatcher: &Dispatcher, device: usize, run_id: &RunId) -> Envelope {
    let ready = Envelope::new(Command::RexecReady(Mode::Sync))
        .with_actid(format!("dev-{device}"))
        .with_actarg(run_id.to_string());
    dispatcher.handle_request(&ready).await.unwrap()
}

async fn respond(dispatcher: &Dispatcher, run_id: &RunId, value: Value) {
    let response = Envelope::new(Command::ReportReq)
        .with_actname("EVENTLOOP")
        .with_actarg(run_id.to_string())
        .with_args(vec![value]);
    let reply = dispatcher
        .handle_frame(InboundChannel::Survey, &response.encode().unwrap())
        .await
        .unwrap();
    assert!(reply.is_none());
}

fn sync_run_id(name: &str, args: Vec<Value>, expr: &str) -> RunId {
    run_id_for(&Envelope::call(Mode::Sync, name, expr, args)).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}

fn config(policy: AdmissionPolicy) -> BrokerConfig {
    BrokerConfig {
        admission_policy: policy,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn sync_exec_resolves_with_survey_quorum() {
    init_tracing();
    let (broker, transport) = test_broker(config(AdmissionPolicy::Majority(0.5)));
    let dispatcher = broker.dispatcher();
    register_fleet(&dispatcher, 4).await;
    let free_ports = broker.survey_ports_available();

    let args = vec![Value::from("room-1")];
    let caller = {
        let broker = broker.clone();
        let args = args.clone();
        tokio::spawn(async move { broker.remote_sync_exec("temperature", args, "avg").await })
    };
    let run_id = sync_run_id("temperature", args, "avg");
    wait_until(|| broker.run(&run_id).is_some()).await;

    let run = broker.run(&run_id).unwrap();
    assert_eq!(run.needed, 4);
    assert_eq!(run.phase, RunPhase::AwaitingAdmission);
    let port = run.survey_port.unwrap();

    broker.publish_tick().await;
    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].1.cmd, "REXEC-CALL");
    assert_eq!(published[0].1.opt, "SYN");
    assert_eq!(published[0].1.actid, run_id.to_string());

    let mut replies = Vec::new();
    for device in 0..4 {
        replies.push(ready(&dispatcher, device, &run_id).await);
    }
    let commands: Vec<Command> = replies.iter().map(|r| r.command().unwrap()).collect();
    assert_eq!(
        commands,
        vec![
            Command::RexecStart(Mode::Sync),
            Command::RexecStart(Mode::Sync),
            Command::RexecStart(Mode::Sync),
            Command::RexecQuit(Mode::Sync),
        ]
    );
    assert_eq!(replies[0].args, vec![Value::from(port)]);
    assert!(replies[3].args.is_empty());
    // Every expected peer replied; nothing left to retransmit.
    assert!(broker.queued_retries(&run_id).is_empty());

    wait_until(|| !transport.survey_messages().is_empty()).await;
    let (survey_port, report) = transport.survey_messages().remove(0);
    assert_eq!(survey_port, port);
    assert_eq!(report.cmd, "REPORT-REQ");
    assert_eq!(report.actarg, run_id.to_string());
    assert_eq!(transport.open_surveys(), vec![port]);

    for value in 1..=4i64 {
        respond(&dispatcher, &run_id, Value::from(value)).await;
    }

    let results = caller.await.unwrap().unwrap();
    assert_eq!(
        results,
        vec![Value::Num(1.0), Value::Num(2.0), Value::Num(3.0)]
    );
    assert_eq!(broker.survey_ports_available(), free_ports);
    assert_eq!(transport.closed_surveys(), vec![port]);
    // Completed runs stay in the table for late stragglers.
    let run = broker.run(&run_id).unwrap();
    assert_eq!(run.phase, RunPhase::Resolved);
    assert_eq!(run.results.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn survey_timeout_rejects_and_cleans_up() {
    init_tracing();
    let (broker, transport) = test_broker(config(AdmissionPolicy::Majority(0.5)));
    let dispatcher = broker.dispatcher();
    register_fleet(&dispatcher, 4).await;
    let free_ports = broker.survey_ports_available();

    let caller = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.remote_sync_exec("scan", vec![], "e").await })
    };
    let run_id = sync_run_id("scan", vec![], "e");
    wait_until(|| broker.run(&run_id).is_some()).await;

    for device in 0..3 {
        ready(&dispatcher, device, &run_id).await;
    }
    wait_until(|| !transport.survey_messages().is_empty()).await;
    let port = transport.open_surveys()[0];
    respond(&dispatcher, &run_id, Value::from("only")).await;

    tokio::time::sleep(Duration::from_secs(3)).await;

    let result = caller.await.unwrap();
    assert!(matches!(
        result,
        Err(BrokerError::Timeout {
            phase: Phase::Survey,
            ..
        })
    ));
    assert!(broker.run(&run_id).is_none());
    assert_eq!(broker.survey_ports_available(), free_ports);
    assert_eq!(transport.closed_surveys(), vec![port]);
    assert!(transport.open_surveys().is_empty());
    // The call was withdrawn and replaced by a kill broadcast.
    assert_eq!(broker.queued_retries(&run_id), vec![5]);

    // A result arriving after the teardown changes nothing.
    respond(&dispatcher, &run_id, Value::from("late")).await;
    assert_eq!(broker.survey_ports_available(), free_ports);
}

#[tokio::test(start_paused = true)]
async fn admission_timeout_cancels_and_broadcasts_kill() {
    init_tracing();
    let (broker, transport) = test_broker(config(AdmissionPolicy::Majority(1.0)));
    let dispatcher = broker.dispatcher();
    register_fleet(&dispatcher, 4).await;
    let free_ports = broker.survey_ports_available();

    let caller = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.remote_sync_exec("scan", vec![], "e").await })
    };
    let run_id = sync_run_id("scan", vec![], "e");
    wait_until(|| broker.run(&run_id).is_some()).await;

    // Full consensus: every respondent starts, but two of four never reply.
    for device in 0..2 {
        let reply = ready(&dispatcher, device, &run_id).await;
        assert_eq!(reply.command().unwrap(), Command::RexecStart(Mode::Sync));
    }

    tokio::time::sleep(Duration::from_secs(1)).await;

    let result = caller.await.unwrap();
    assert!(matches!(
        result,
        Err(BrokerError::Timeout {
            phase: Phase::Admission,
            ..
        })
    ));
    assert!(broker.run(&run_id).is_none());
    assert_eq!(broker.survey_ports_available(), free_ports);
    assert!(transport.survey_messages().is_empty());

    broker.publish_tick().await;
    let kills: Vec<Envelope> = transport
        .published()
        .into_iter()
        .map(|(_, envelope)| envelope)
        .filter(|envelope| envelope.cmd == "REXEC-KILL")
        .collect();
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].actarg, run_id.to_string());
    assert_eq!(kills[0].actname, "ACTIVITY");

    // Late readiness for the torn-down run is told to stand down.
    let late = ready(&dispatcher, 3, &run_id).await;
    assert_eq!(late.command().unwrap(), Command::RexecQuit(Mode::Sync));
}

#[tokio::test(start_paused = true)]
async fn first_policy_admits_only_the_first_peer() {
    let (broker, transport) = test_broker(config(AdmissionPolicy::First));
    let dispatcher = broker.dispatcher();
    register_fleet(&dispatcher, 3).await;

    let caller = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.remote_sync_exec("scan", vec![], "e").await })
    };
    let run_id = sync_run_id("scan", vec![], "e");
    wait_until(|| broker.run(&run_id).is_some()).await;

    let first = ready(&dispatcher, 0, &run_id).await;
    assert_eq!(first.command().unwrap(), Command::RexecStart(Mode::Sync));
    for device in 1..3 {
        let later = ready(&dispatcher, device, &run_id).await;
        assert_eq!(later.command().unwrap(), Command::RexecQuit(Mode::Sync));
    }

    wait_until(|| !transport.survey_messages().is_empty()).await;
    // needed = 3, threshold 0.5: two results are required.
    respond(&dispatcher, &run_id, Value::from(1i64)).await;
    respond(&dispatcher, &run_id, Value::from(2i64)).await;
    let results = caller.await.unwrap().unwrap();
    assert_eq!(results.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn survey_ports_survive_repeated_cancellation() {
    let (broker, transport) = test_broker(BrokerConfig::default());
    let free_ports = broker.survey_ports_available();

    for i in 0..20 {
        let expr = format!("cycle-{i}");
        let caller = {
            let broker = broker.clone();
            let expr = expr.clone();
            tokio::spawn(async move { broker.remote_sync_exec("scan", vec![], &expr).await })
        };
        let run_id = sync_run_id("scan", vec![], &expr);
        wait_until(|| broker.run(&run_id).is_some()).await;
        assert_eq!(broker.survey_ports_available(), free_ports - 1);

        assert!(broker.cancel(&run_id).await);
        assert!(!broker.cancel(&run_id).await);
        let result = caller.await.unwrap();
        assert!(matches!(result, Err(BrokerError::Cancelled { .. })));
    }

    assert_eq!(broker.survey_ports_available(), free_ports);
    assert!(transport.open_surveys().is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeated_call_supersedes_the_live_one() {
    let (broker, _) = test_broker(BrokerConfig::default());
    let free_ports = broker.survey_ports_available();
    let run_id = sync_run_id("scan", vec![], "e");

    let first = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.remote_sync_exec("scan", vec![], "e").await })
    };
    wait_until(|| broker.run(&run_id).is_some()).await;
    let first_port = broker.run(&run_id).unwrap().survey_port;

    let second = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.remote_sync_exec("scan", vec![], "e").await })
    };
    wait_until(|| broker.run(&run_id).is_some_and(|run| run.survey_port != first_port)).await;

    let result = first.await.unwrap();
    assert!(matches!(result, Err(BrokerError::Cancelled { .. })));
    // Only the live run holds a port, and the superseded caller left it alone.
    assert_eq!(broker.survey_ports_available(), free_ports - 1);
    assert_eq!(broker.run(&run_id).unwrap().phase, RunPhase::AwaitingAdmission);
    assert_eq!(broker.queued_retries(&run_id), vec![5]);

    broker.cancel(&run_id).await;
    assert!(matches!(
        second.await.unwrap(),
        Err(BrokerError::Cancelled { .. })
    ));
    assert_eq!(broker.survey_ports_available(), free_ports);
}

#[tokio::test(start_paused = true)]
async fn abandoned_caller_still_releases_its_survey_port() {
    let (broker, transport) = test_broker(BrokerConfig::default());
    let dispatcher = broker.dispatcher();
    register_fleet(&dispatcher, 2).await;
    let free_ports = broker.survey_ports_available();
    let run_id = sync_run_id("scan", vec![], "e");

    // The caller gives up well before the admission deadline.
    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        broker.remote_sync_exec("scan", vec![], "e"),
    )
    .await;
    assert!(outcome.is_err());
    assert_eq!(broker.survey_ports_available(), free_ports - 1);

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(broker.run(&run_id).is_none());
    assert_eq!(broker.survey_ports_available(), free_ports);
    assert!(transport.open_surveys().is_empty());
    assert_eq!(broker.queued_retries(&run_id), vec![5]);
}

#[tokio::test(start_paused = true)]
async fn abandoned_caller_mid_survey_releases_its_channel() {
    let (broker, transport) = test_broker(config(AdmissionPolicy::Majority(0.5)));
    let dispatcher = broker.dispatcher();
    register_fleet(&dispatcher, 2).await;
    let free_ports = broker.survey_ports_available();
    let run_id = sync_run_id("scan", vec![], "e");

    let caller = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.remote_sync_exec("scan", vec![], "e").await })
    };
    wait_until(|| broker.run(&run_id).is_some()).await;
    for device in 0..2 {
        ready(&dispatcher, device, &run_id).await;
    }
    wait_until(|| !transport.open_surveys().is_empty()).await;
    let port = transport.open_surveys()[0];
    caller.abort();

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(broker.run(&run_id).is_none());
    assert_eq!(broker.survey_ports_available(), free_ports);
    assert_eq!(transport.closed_surveys(), vec![port]);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_survey_bind_closes_the_late_channel() {
    let (broker, transport) = test_broker(BrokerConfig::default());
    let dispatcher = broker.dispatcher();
    register_fleet(&dispatcher, 1).await;
    let free_ports = broker.survey_ports_available();
    transport.hold_survey_binds(true);

    let caller = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.remote_sync_exec("scan", vec![], "e").await })
    };
    let run_id = sync_run_id("scan", vec![], "e");
    wait_until(|| broker.run(&run_id).is_some()).await;
    let port = broker.run(&run_id).unwrap().survey_port.unwrap();

    let start = ready(&dispatcher, 0, &run_id).await;
    assert_eq!(start.command().unwrap(), Command::RexecStart(Mode::Sync));
    wait_until(|| transport.pending_survey_binds() == 1).await;

    // The channel is not open yet, so the cancel cannot close it.
    assert!(broker.cancel(&run_id).await);
    assert!(transport.closed_surveys().is_empty());
    transport.release_survey_bind();

    let result = caller.await.unwrap();
    assert!(matches!(result, Err(BrokerError::Cancelled { .. })));
    assert!(transport.open_surveys().is_empty());
    assert_eq!(transport.closed_surveys(), vec![port]);
    assert!(transport.survey_messages().is_empty());
    assert_eq!(broker.survey_ports_available(), free_ports);
}
