use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use courier::client::{connect_in_vm, ClientConnection, ClientSession, SessionOptions};
use courier::config::BrokerConfig;
use courier::error::XaCode;
use courier::server::AllowAllSecurityManager;
use courier::transaction::Xid;
use courier::{Broker, Error, Message};

const WAIT: Duration = Duration::from_secs(5);

fn config(dir: &Path) -> BrokerConfig {
    let mut config = BrokerConfig::with_data_dir(dir);
    config.journal.file_size = 64 * 1024;
    config
}

fn start(config: BrokerConfig) -> Arc<Broker> {
    Broker::start(config, Arc::new(AllowAllSecurityManager)).expect("broker")
}

fn xid(branch: &str) -> Xid {
    Xid::new(0x1234, "global-1", branch)
}

fn xa_code<T: std::fmt::Debug>(result: courier::Result<T>) -> XaCode {
    match result {
        Err(Error::Xa { code, .. }) => code,
        other => panic!("expected an xa error, got {other:?}"),
    }
}

fn prepare_one_send(broker: &Broker, xid: &Xid) {
    let connection = connect_in_vm(broker, None, None).unwrap();
    let session = connection.create_session(SessionOptions::xa()).unwrap();
    session.create_queue("payments", "payments.q", None, true, false).unwrap();
    session.xa_start(xid).unwrap();
    session
        .create_producer(Some("payments"))
        .unwrap()
        .send(Message::new("", "transfer 100").with_durable(true))
        .unwrap();
    session.xa_end(xid, false).unwrap();
    session.xa_prepare(xid).unwrap();
    assert_eq!(session.queue_query("payments.q").unwrap().message_count, 0);
}

#[test]
fn prepared_branch_survives_restart_and_commits() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let xid = xid("branch-a");
    {
        let broker = start(cfg.clone());
        prepare_one_send(&broker, &xid);
        broker.stop();
    }

    let broker = start(cfg);
    assert_eq!(broker.resource_manager().in_doubt_xids(), vec![xid.clone()]);
    let connection = connect_in_vm(&broker, None, None).unwrap();
    let session = connection.create_session(SessionOptions::xa()).unwrap();
    assert_eq!(session.xa_recover().unwrap(), vec![xid.clone()]);
    assert_eq!(session.queue_query("payments.q").unwrap().message_count, 0);

    session.xa_commit(&xid, false).unwrap();
    assert!(session.xa_recover().unwrap().is_empty());

    let reader = connection.create_session(SessionOptions::default()).unwrap();
    let consumer = reader.create_consumer("payments.q", None).unwrap();
    connection.start().unwrap();
    let message = consumer.receive(WAIT).unwrap().expect("committed message");
    assert_eq!(&message.body()[..], b"transfer 100");
    message.acknowledge().unwrap();
}

#[test]
fn prepared_branch_rolls_back_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let xid = xid("branch-b");
    {
        let broker = start(cfg.clone());
        prepare_one_send(&broker, &xid);
        broker.stop();
    }
    {
        let broker = start(cfg.clone());
        let connection = connect_in_vm(&broker, None, None).unwrap();
        let session = connection.create_session(SessionOptions::xa()).unwrap();
        session.xa_rollback(&xid).unwrap();
        assert!(session.xa_recover().unwrap().is_empty());
        broker.stop();
    }

    let broker = start(cfg);
    assert!(broker.resource_manager().in_doubt_xids().is_empty());
    assert_eq!(broker.post_office().queue("payments.q").unwrap().message_count(), 0);
}

#[test]
fn one_phase_commit_skips_prepare() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start(config(dir.path()));
    let connection = connect_in_vm(&broker, None, None).unwrap();
    let session = connection.create_session(SessionOptions::xa()).unwrap();
    session.create_queue("payments", "payments.q", None, true, false).unwrap();
    let xid = xid("one-phase");

    session.xa_start(&xid).unwrap();
    session
        .create_producer(Some("payments"))
        .unwrap()
        .send(Message::new("", "quick").with_durable(true))
        .unwrap();
    session.xa_end(&xid, false).unwrap();
    assert_eq!(xa_code(session.xa_commit(&xid, false)), XaCode::Protocol);
    session.xa_commit(&xid, true).unwrap();
    assert_eq!(session.queue_query("payments.q").unwrap().message_count, 1);
}

#[test]
fn failed_end_forces_rollback_at_prepare() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start(config(dir.path()));
    let connection = connect_in_vm(&broker, None, None).unwrap();
    let session = connection.create_session(SessionOptions::xa()).unwrap();
    session.create_queue("payments", "payments.q", None, true, false).unwrap();
    let xid = xid("doomed");

    session.xa_start(&xid).unwrap();
    session
        .create_producer(Some("payments"))
        .unwrap()
        .send(Message::new("", "never").with_durable(true))
        .unwrap();
    session.xa_end(&xid, true).unwrap();
    assert_eq!(xa_code(session.xa_prepare(&xid)), XaCode::RollbackOther);
    assert_eq!(xa_code(session.xa_commit(&xid, false)), XaCode::NoTransaction);
    assert_eq!(session.queue_query("payments.q").unwrap().message_count, 0);
}

#[test]
fn xa_errors_carry_their_codes() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start(config(dir.path()));
    let connection = connect_in_vm(&broker, None, None).unwrap();
    let session = connection.create_session(SessionOptions::xa()).unwrap();
    let known = xid("known");

    assert_eq!(xa_code(session.xa_commit(&xid("unknown"), false)), XaCode::NoTransaction);
    assert_eq!(xa_code(session.xa_forget(&xid("unknown"))), XaCode::NoTransaction);

    session.xa_start(&known).unwrap();
    assert_eq!(xa_code(session.xa_start(&xid("second"))), XaCode::Protocol);
    assert_eq!(xa_code(session.xa_prepare(&known)), XaCode::Protocol);
    assert!(matches!(session.commit(), Err(Error::IllegalState(_))));
    assert!(matches!(session.rollback(), Err(Error::IllegalState(_))));

    session.xa_suspend().unwrap();
    assert_eq!(xa_code(session.xa_resume(&xid("other"))), XaCode::Protocol);
    session.xa_resume(&known).unwrap();
    session.xa_end(&known, false).unwrap();
    session.xa_rollback(&known).unwrap();
}

#[test]
fn timeout_is_reported_in_seconds() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start(config(dir.path()));
    let connection = connect_in_vm(&broker, None, None).unwrap();
    let session = connection.create_session(SessionOptions::xa()).unwrap();

    assert!(session.xa_set_timeout(42).unwrap());
    assert_eq!(session.xa_get_timeout().unwrap(), 42);
}
