//! Enforcer restarts and direct protocol checks

use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use falcon::client::ClientCoordinator;
use falcon::generation::Generation;
use falcon::rpc::{ClientAddr, EnforcerLink, RpcPolicy, SpyRequest, TargetRef, TcpLink};
use falcon::status::{FalconStatus, SpyStatus};

use super::helpers::{chain, client_config, enforcer_config, next_terminal, recorder, start_enforcer, WAIT};

fn link(addr: std::net::SocketAddr) -> TcpLink {
    TcpLink::new(
        addr,
        RpcPolicy {
            timeout: Duration::from_secs(2),
            attempts: 1,
        },
    )
}

fn generation_of(link: &TcpLink, target: &str) -> Generation {
    let reply = link
        .call(&SpyRequest::GetGeneration {
            target: TargetRef::new(target, Generation::empty()),
            client: ClientAddr::new("127.0.0.1:9".parse().unwrap(), 0),
        })
        .unwrap();
    assert_eq!(reply.status, SpyStatus::GenResponse);
    reply.target.generation
}

#[test]
#[serial]
fn test_generation_survives_enforcer_restart() {
    let dir = TempDir::new().unwrap();
    let config = enforcer_config(&dir);

    let enforcer = start_enforcer(&config);
    {
        let coordinator =
            ClientCoordinator::start(&client_config(&[("hostA", enforcer.local_addr())])).unwrap();
        let (callback, statuses) = recorder();
        coordinator
            .start_monitoring(&chain(&["dead", "hostA"]), false, Some(callback), None, -1)
            .unwrap();
        assert_eq!(
            next_terminal(&statuses, WAIT),
            Some(FalconStatus::RemoteWouldKill)
        );
    }
    assert_eq!(
        generation_of(&link(enforcer.local_addr()), "dead"),
        Generation::new(vec![1])
    );
    enforcer.shutdown();
    enforcer.join().unwrap();

    let restarted = start_enforcer(&config);
    assert_eq!(
        generation_of(&link(restarted.local_addr()), "dead"),
        Generation::new(vec![1])
    );
    assert_eq!(
        generation_of(&link(restarted.local_addr()), "alive"),
        Generation::new(vec![0])
    );
}

#[test]
#[serial]
fn test_register_with_wrong_length_is_rejected() {
    let dir = TempDir::new().unwrap();
    let enforcer = start_enforcer(&enforcer_config(&dir));
    let link = link(enforcer.local_addr());

    let reply = link
        .call(&SpyRequest::Register {
            target: TargetRef::new("alive", Generation::new(vec![0, 0])),
            client: ClientAddr::new("127.0.0.1:9".parse().unwrap(), 1),
            lethal: false,
            up_interval_ms: 0,
        })
        .unwrap();
    assert_eq!(reply.status, SpyStatus::BadGenVec);
    assert_eq!(reply.target.generation, Generation::new(vec![0]));
}

#[test]
#[serial]
fn test_second_enforcer_cannot_share_a_log() {
    let dir = TempDir::new().unwrap();
    let config = enforcer_config(&dir);
    let _first = start_enforcer(&config);

    let second = falcon::enforcer::EnforcerServer::start(
        &config,
        Box::new(falcon::probe::ScriptedProbe::standard(Duration::from_millis(20))),
    );
    assert!(second.is_err());
}
