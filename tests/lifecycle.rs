//! Checkpoint lifetime across the group: active handover, node loss,
//! unlink, retention, and client finalize.

mod common;

use common::{attrs, Cluster, RW_COLOCATED};

use tokio::time::Duration;

use checkpointd::{
    CheckpointdError, CkptError, ClientCall, CreationFlags, OpenFlags,
    ReplyData, TIME_END,
};

#[test]
fn active_node_failover() -> Result<(), CheckpointdError> {
    let mut cluster = Cluster::new(&["n1", "n2", "n3"])?;
    let a = cluster.init_client("n1")?;
    let b = cluster.init_client("n2")?;
    cluster.open(
        "n1",
        a,
        "c",
        RW_COLOCATED,
        Some(attrs(CreationFlags::WriteAllReplicas, 4, 100, 0)),
    )?;
    let ckpt_b = cluster.open("n2", b, "c", RW_COLOCATED, None)?;

    cluster.kill("n1")?;
    let replica = cluster.service("n2")?.replica("c");
    assert!(replica.is_some_and(|r| r.is_active && r.nodes() == vec!["n2"]));

    assert_eq!(
        cluster.call(
            "n2",
            b,
            ClientCall::SectionCreate {
                ckpt: ckpt_b,
                id: b"after".to_vec(),
                expiration: TIME_END,
                data: b"crash".to_vec(),
            },
        )?,
        Ok(ReplyData::Done)
    );
    Ok(())
}

#[test]
fn failover_noticed_out_of_order() -> Result<(), CheckpointdError> {
    let mut cluster = Cluster::new(&["n1", "n2", "n3"])?;
    let a = cluster.init_client("n1")?;
    let b = cluster.init_client("n2")?;
    let c = cluster.init_client("n3")?;
    cluster.open(
        "n1",
        a,
        "c",
        RW_COLOCATED,
        Some(attrs(CreationFlags::WriteAllReplicas, 4, 100, 0)),
    )?;
    cluster.open("n2", b, "c", RW_COLOCATED, None)?;
    let ckpt_c = cluster.open("n3", c, "c", RW_COLOCATED, None)?;

    // n3 learns of the loss first and routes to n2, which does not know
    // yet that it is the new active node
    cluster.crash("n1")?;
    cluster.notify_down("n3", "n1")?;
    cluster.deliver_all()?;
    let req = cluster.submit(
        "n3",
        c,
        ClientCall::SectionCreate {
            ckpt: ckpt_c,
            id: b"late".to_vec(),
            expiration: TIME_END,
            data: b"news".to_vec(),
        },
    )?;
    cluster.deliver_all()?;
    assert_eq!(cluster.take_reply("n3", c, req)?, None);

    cluster.notify_down("n2", "n1")?;
    cluster.deliver_all()?;
    assert_eq!(cluster.take_reply("n3", c, req)?, Some(Ok(ReplyData::Done)));
    for node in ["n2", "n3"] {
        let replica = cluster.service(node)?.replica("c");
        assert!(replica.is_some_and(|r| r.active_node == "n2"
            && r.sections.find(b"late").is_some()
            && !r.locked));
    }
    Ok(())
}

#[test]
fn standby_survives_loss() -> Result<(), CheckpointdError> {
    let mut cluster = Cluster::new(&["n1", "n2"])?;
    let a = cluster.init_client("n1")?;
    let b = cluster.init_client("n2")?;
    let ckpt_a = cluster.open(
        "n1",
        a,
        "c",
        RW_COLOCATED,
        Some(attrs(CreationFlags::WriteAllReplicas, 4, 100, 0)),
    )?;
    cluster.open("n2", b, "c", RW_COLOCATED, None)?;

    // losing the standby shrinks the participant set of later updates
    cluster.kill("n2")?;
    assert_eq!(
        cluster.call(
            "n1",
            a,
            ClientCall::SectionCreate {
                ckpt: ckpt_a,
                id: b"s".to_vec(),
                expiration: TIME_END,
                data: b"alone".to_vec(),
            },
        )?,
        Ok(ReplyData::Done)
    );
    let replica = cluster.service("n1")?.replica("c");
    assert!(replica.is_some_and(|r| r.nodes() == vec!["n1"] && !r.locked));
    Ok(())
}

#[test]
fn set_active_handover() -> Result<(), CheckpointdError> {
    let mut cluster = Cluster::new(&["n1", "n2", "n3"])?;
    let a = cluster.init_client("n1")?;
    let b = cluster.init_client("n2")?;
    let c = cluster.init_client("n3")?;
    let ckpt_a = cluster.open(
        "n1",
        a,
        "c",
        RW_COLOCATED,
        Some(attrs(CreationFlags::WriteAllReplicas, 4, 100, 0)),
    )?;
    let ckpt_b = cluster.open("n2", b, "c", RW_COLOCATED, None)?;
    cluster.open("n3", c, "c", RW_COLOCATED, None)?;

    assert_eq!(
        cluster.call("n2", b, ClientCall::ActiveSet { ckpt: ckpt_b })?,
        Ok(ReplyData::Done)
    );
    for node in ["n1", "n2", "n3"] {
        let replica = cluster.service(node)?.replica("c");
        assert!(replica.is_some_and(|r| r.active_node == "n2"
            && r.is_active == (node == "n2")
            && !r.pending_pause));
    }

    // updates now go through n2
    assert_eq!(
        cluster.call(
            "n1",
            a,
            ClientCall::SectionCreate {
                ckpt: ckpt_a,
                id: b"s".to_vec(),
                expiration: TIME_END,
                data: b"moved".to_vec(),
            },
        )?,
        Ok(ReplyData::Done)
    );
    let replica = cluster.service("n3")?.replica("c");
    assert!(replica.is_some_and(|r| r.sections.find(b"s").is_some()));

    // asking the active node to become active is a no-op
    assert_eq!(
        cluster.call("n2", b, ClientCall::ActiveSet { ckpt: ckpt_b })?,
        Ok(ReplyData::Done)
    );
    Ok(())
}

#[test]
fn unlink_then_last_close() -> Result<(), CheckpointdError> {
    let mut cluster = Cluster::new(&["n1", "n2"])?;
    let a = cluster.init_client("n1")?;
    let b = cluster.init_client("n2")?;
    let ckpt_a = cluster.open(
        "n1",
        a,
        "c",
        RW_COLOCATED,
        Some(attrs(CreationFlags::WriteAllReplicas, 4, 100, TIME_END)),
    )?;

    assert_eq!(
        cluster.call("n2", b, ClientCall::Unlink { name: "c".into() })?,
        Ok(ReplyData::Done)
    );
    // still usable by the existing opener, invisible to new ones
    let replica = cluster.service("n1")?.replica("c");
    assert!(replica.is_some_and(|r| r.unlinked));
    let reopen = ClientCall::Open {
        name: "c".into(),
        flags: OpenFlags::READ,
        attrs: None,
    };
    assert_eq!(cluster.call("n1", a, reopen)?, Err(CkptError::InvalidParam));

    assert_eq!(
        cluster.call("n1", a, ClientCall::Close { ckpt: ckpt_a })?,
        Ok(ReplyData::Done)
    );
    assert!(cluster.service("n1")?.replica("c").is_none());

    // the name is free again
    cluster.open(
        "n2",
        b,
        "c",
        RW_COLOCATED,
        Some(attrs(CreationFlags::WriteAllReplicas, 8, 10, 0)),
    )?;
    Ok(())
}

#[test]
fn retention_expiry() -> Result<(), CheckpointdError> {
    let mut cluster = Cluster::new(&["n1"])?;
    let a = cluster.init_client("n1")?;
    let short = cluster.open(
        "n1",
        a,
        "short",
        RW_COLOCATED,
        Some(attrs(CreationFlags::WriteAllReplicas, 1, 10, 1_000_000)),
    )?;
    let forever = cluster.open(
        "n1",
        a,
        "forever",
        RW_COLOCATED,
        Some(attrs(CreationFlags::WriteAllReplicas, 1, 10, TIME_END)),
    )?;
    for ckpt in [short, forever] {
        assert_eq!(
            cluster.call("n1", a, ClientCall::Close { ckpt })?,
            Ok(ReplyData::Done)
        );
    }
    assert!(cluster.service("n1")?.retention_pending("short"));
    assert!(!cluster.service("n1")?.retention_pending("forever"));

    cluster.fire_timeouts("n1", Duration::from_secs(1))?;
    assert!(cluster.service("n1")?.replica("short").is_none());
    assert!(cluster.service("n1")?.replica("forever").is_some());

    // reopening cancels retention; setting it again while open takes
    // effect on the next close
    let again = cluster.open("n1", a, "forever", RW_COLOCATED, None)?;
    assert_eq!(
        cluster.call(
            "n1",
            a,
            ClientCall::RetentionSet {
                ckpt: again,
                retention: 0,
            },
        )?,
        Ok(ReplyData::Done)
    );
    assert_eq!(
        cluster.call("n1", a, ClientCall::Close { ckpt: again })?,
        Ok(ReplyData::Done)
    );
    cluster.fire_timeouts("n1", Duration::from_millis(10))?;
    assert!(cluster.service("n1")?.replica("forever").is_none());
    Ok(())
}

#[test]
fn finalize_refused_while_open() -> Result<(), CheckpointdError> {
    let mut cluster = Cluster::new(&["n1"])?;
    let a = cluster.init_client("n1")?;
    let ckpt = cluster.open(
        "n1",
        a,
        "c",
        RW_COLOCATED,
        Some(attrs(CreationFlags::WriteAllReplicas, 1, 10, TIME_END)),
    )?;
    assert_eq!(cluster.call("n1", a, ClientCall::Finalize)?, Err(CkptError::Busy));
    assert_eq!(
        cluster.call("n1", a, ClientCall::Close { ckpt })?,
        Ok(ReplyData::Done)
    );
    assert_eq!(cluster.call("n1", a, ClientCall::Finalize)?, Ok(ReplyData::Done));
    assert!(cluster.service("n1")?.client(a).is_none());
    Ok(())
}

#[test]
fn unlink_needs_an_existing_name() -> Result<(), CheckpointdError> {
    let mut cluster = Cluster::new(&["n1", "n2"])?;
    let a = cluster.init_client("n1")?;
    let b = cluster.init_client("n2")?;
    let unlink = |name: &str| ClientCall::Unlink { name: name.into() };
    assert_eq!(cluster.call("n1", a, unlink("ghost"))?, Err(CkptError::NotExist));

    cluster.open(
        "n1",
        a,
        "c",
        RW_COLOCATED,
        Some(attrs(CreationFlags::WriteAllReplicas, 4, 100, TIME_END)),
    )?;

    // a node that came up after the creation still knows the name
    cluster.join("n3")?;
    let c = cluster.init_client("n3")?;
    assert_eq!(cluster.call("n3", c, unlink("c"))?, Ok(ReplyData::Done));

    // gone for everyone once unlinked, even while n1 keeps it open
    assert_eq!(cluster.call("n1", a, unlink("c"))?, Err(CkptError::NotExist));
    assert_eq!(cluster.call("n2", b, unlink("c"))?, Err(CkptError::NotExist));
    assert!(cluster.service("n1")?.replica("c").is_some_and(|r| r.unlinked));
    Ok(())
}
