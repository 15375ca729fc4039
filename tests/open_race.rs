//! Opening checkpoints across an in-memory group.

mod common;

use common::{attrs, Cluster, RW, RW_COLOCATED};

use tokio::time::Duration;

use checkpointd::{
    CheckpointdError, CkptError, ClientCall, CreationFlags, OpenFlags,
    ReplyData, ServiceConfig, Target,
};

#[test]
fn simultaneous_colocated_create() -> Result<(), CheckpointdError> {
    let mut cluster = Cluster::new(&["n1", "n2", "n3"])?;
    let a = cluster.init_client("n1")?;
    let b = cluster.init_client("n2")?;
    let open = ClientCall::Open {
        name: "shared".into(),
        flags: RW_COLOCATED,
        attrs: Some(attrs(CreationFlags::WriteAllReplicas, 4, 100, 0)),
    };

    // both opens are in the air before anyone hears of the other
    let req_a = cluster.submit("n1", a, open.clone())?;
    let req_b = cluster.submit("n2", b, open)?;
    cluster.deliver_all()?;

    assert!(matches!(
        cluster.take_reply("n1", a, req_a)?,
        Some(Ok(ReplyData::CkptHandle(_)))
    ));
    assert!(matches!(
        cluster.take_reply("n2", b, req_b)?,
        Some(Ok(ReplyData::CkptHandle(_)))
    ));

    // one creation: both replicas agree on the same single active node
    let r1 = cluster.service("n1")?.replica("shared");
    let r2 = cluster.service("n2")?.replica("shared");
    let (r1, r2) = match (r1, r2) {
        (Some(r1), Some(r2)) => (r1, r2),
        _ => return Err(CheckpointdError::msg("missing replica")),
    };
    assert_eq!(r1.active_node, r2.active_node);
    assert_eq!(r1.nodes(), vec!["n1".to_string(), "n2".to_string()]);
    assert_eq!(r2.nodes(), r1.nodes());
    assert!(r1.is_active != r2.is_active);
    assert!(cluster.service("n3")?.replica("shared").is_none());
    assert!(!cluster.service("n1")?.is_racing("shared"));
    assert!(!cluster.service("n2")?.is_racing("shared"));
    Ok(())
}

#[test]
fn join_existing_replica() -> Result<(), CheckpointdError> {
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
    assert_eq!(
        cluster.call(
            "n1",
            a,
            ClientCall::SectionCreate {
                ckpt: ckpt_a,
                id: b"s".to_vec(),
                expiration: checkpointd::TIME_END,
                data: b"hello".to_vec(),
            },
        )?,
        Ok(ReplyData::Done)
    );

    // joining copies the existing content over
    let ckpt_b = cluster.open("n2", b, "c", RW_COLOCATED, None)?;
    let joined = cluster.service("n2")?.replica("c");
    assert!(joined.is_some_and(|r| !r.joining && r.active_node == "n1"));
    assert_eq!(
        cluster.call(
            "n2",
            b,
            ClientCall::Read {
                ckpt: ckpt_b,
                id: b"s".to_vec(),
                offset: 0,
                size: 5,
            },
        )?,
        Ok(ReplyData::Data(b"hello".to_vec()))
    );
    assert!(cluster
        .service("n2")?
        .replica("c")
        .is_some_and(|r| r.sections.find(b"s").is_some()));
    Ok(())
}

#[test]
fn remote_open() -> Result<(), CheckpointdError> {
    let mut cluster = Cluster::new(&["n1", "n2"])?;
    let a = cluster.init_client("n1")?;
    let b = cluster.init_client("n2")?;
    cluster.open(
        "n1",
        a,
        "c",
        RW,
        Some(attrs(CreationFlags::WriteAllReplicas, 4, 100, 0)),
    )?;

    let ckpt_b = cluster.open("n2", b, "c", RW, None)?;
    assert!(cluster.service("n2")?.replica("c").is_none());
    assert!(matches!(
        cluster
            .service("n2")?
            .open_checkpoint(ckpt_b)
            .map(|o| o.target.clone()),
        Some(Target::Remote { active_node, handle_node, .. })
            if active_node == "n1" && handle_node == "n1"
    ));
    assert_eq!(
        cluster.service("n1")?.replica("c").map(|r| r.ref_count()),
        Some(2)
    );

    // calls through the remote handle land on the replica at n1
    assert_eq!(
        cluster.call(
            "n2",
            b,
            ClientCall::SectionCreate {
                ckpt: ckpt_b,
                id: b"r".to_vec(),
                expiration: checkpointd::TIME_END,
                data: b"remote".to_vec(),
            },
        )?,
        Ok(ReplyData::Done)
    );
    assert!(cluster
        .service("n1")?
        .replica("c")
        .is_some_and(|r| r.sections.find(b"r").is_some()));

    // closing releases the reference held at n1
    assert_eq!(
        cluster.call("n2", b, ClientCall::Close { ckpt: ckpt_b })?,
        Ok(ReplyData::Done)
    );
    assert_eq!(
        cluster.service("n1")?.replica("c").map(|r| r.ref_count()),
        Some(1)
    );
    Ok(())
}

#[test]
fn open_missing_and_mismatched() -> Result<(), CheckpointdError> {
    let mut cluster = Cluster::new(&["n1", "n2"])?;
    let a = cluster.init_client("n1")?;
    let b = cluster.init_client("n2")?;

    let missing = ClientCall::Open {
        name: "nope".into(),
        flags: OpenFlags::READ,
        attrs: None,
    };
    assert_eq!(cluster.call("n2", b, missing)?, Err(CkptError::NotExist));

    cluster.open(
        "n1",
        a,
        "c",
        RW_COLOCATED,
        Some(attrs(CreationFlags::WriteAllReplicas, 4, 100, 0)),
    )?;
    let other = ClientCall::Open {
        name: "c".into(),
        flags: RW_COLOCATED,
        attrs: Some(attrs(CreationFlags::WriteAllReplicas, 8, 100, 0)),
    };
    assert_eq!(cluster.call("n1", a, other.clone())?, Err(CkptError::Exist));
    assert_eq!(cluster.call("n2", b, other)?, Err(CkptError::Exist));
    assert!(cluster.service("n2")?.replica("c").is_none());

    let empty = ClientCall::Open {
        name: String::new(),
        flags: OpenFlags::READ,
        attrs: None,
    };
    assert_eq!(cluster.call("n1", a, empty)?, Err(CkptError::InvalidParam));
    Ok(())
}

#[test]
fn open_times_out_into_local_create() -> Result<(), CheckpointdError> {
    let config = ServiceConfig {
        request_timeout_ms: 100,
        operation_timeout_ms: 100,
    };
    let mut cluster = Cluster::with_config(&["n1", "n2"], config)?;
    let a = cluster.init_client("n1")?;
    let req = cluster.submit(
        "n1",
        a,
        ClientCall::Open {
            name: "lonely".into(),
            flags: RW_COLOCATED,
            attrs: Some(attrs(CreationFlags::WriteActiveReplica, 2, 10, 0)),
        },
    )?;

    // n2 never hears the broadcast
    cluster.discard_all()?;
    assert!(cluster.service("n1")?.is_racing("lonely"));
    assert_eq!(cluster.take_reply("n1", a, req)?, None);

    cluster.fire_timeouts("n1", Duration::from_millis(500))?;
    assert!(matches!(
        cluster.take_reply("n1", a, req)?,
        Some(Ok(ReplyData::CkptHandle(_)))
    ));
    assert!(cluster
        .service("n1")?
        .replica("lonely")
        .is_some_and(|r| r.is_active));
    Ok(())
}

#[test]
fn noncolocated_open_times_out() -> Result<(), CheckpointdError> {
    let config = ServiceConfig {
        request_timeout_ms: 100,
        operation_timeout_ms: 100,
    };
    let mut cluster = Cluster::with_config(&["n1", "n2"], config)?;
    let a = cluster.init_client("n1")?;
    let req = cluster.submit(
        "n1",
        a,
        ClientCall::Open {
            name: "unplaced".into(),
            flags: RW,
            attrs: Some(attrs(CreationFlags::WriteAllReplicas, 2, 10, 0)),
        },
    )?;
    cluster.discard_all()?;

    // without the colocated flag there is no local replica to fall back on
    cluster.fire_timeouts("n1", Duration::from_millis(500))?;
    assert_eq!(
        cluster.take_reply("n1", a, req)?,
        Some(Err(CkptError::Timeout))
    );
    assert!(cluster.service("n1")?.replica("unplaced").is_none());
    assert!(!cluster.service("n1")?.is_racing("unplaced"));
    Ok(())
}
