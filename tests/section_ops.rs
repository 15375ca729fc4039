//! Section updates and reads through the active node.

mod common;

use common::{attrs, Cluster, RW_COLOCATED};

use checkpointd::{
    CheckpointdError, CkptError, CkptHandle, ClientCall, ClientHandle,
    CreationFlags, OpenFlags, ReplyData, SectionsChosen, TIME_END,
};

/// Two nodes holding replicas of "c", opened by one client on each.
fn replicated(
    flags: CreationFlags,
) -> Result<(Cluster, (ClientHandle, CkptHandle), (ClientHandle, CkptHandle)), CheckpointdError>
{
    let mut cluster = Cluster::new(&["n1", "n2"])?;
    let a = cluster.init_client("n1")?;
    let b = cluster.init_client("n2")?;
    let ckpt_a =
        cluster.open("n1", a, "c", RW_COLOCATED, Some(attrs(flags, 4, 100, 0)))?;
    let ckpt_b = cluster.open("n2", b, "c", RW_COLOCATED, None)?;
    Ok((cluster, (a, ckpt_a), (b, ckpt_b)))
}

fn read_all(
    cluster: &mut Cluster,
    node: &str,
    client: ClientHandle,
    ckpt: CkptHandle,
    id: &[u8],
) -> Result<Result<ReplyData, CkptError>, CheckpointdError> {
    cluster.call(
        node,
        client,
        ClientCall::Read {
            ckpt,
            id: id.to_vec(),
            offset: 0,
            size: u64::MAX,
        },
    )
}

#[test]
fn two_phase_write_then_read() -> Result<(), CheckpointdError> {
    let (mut cluster, (a, ckpt_a), (b, ckpt_b)) =
        replicated(CreationFlags::WriteAllReplicas)?;

    assert_eq!(
        cluster.call(
            "n2",
            b,
            ClientCall::SectionCreate {
                ckpt: ckpt_b,
                id: b"s".to_vec(),
                expiration: TIME_END,
                data: b"abcdef".to_vec(),
            },
        )?,
        Ok(ReplyData::Done)
    );
    assert_eq!(
        cluster.call(
            "n1",
            a,
            ClientCall::Write {
                ckpt: ckpt_a,
                id: b"s".to_vec(),
                offset: 4,
                data: b"XYZ".to_vec(),
            },
        )?,
        Ok(ReplyData::Done)
    );

    // committed everywhere, read back through either node
    for node in ["n1", "n2"] {
        let data = cluster
            .service(node)?
            .replica("c")
            .and_then(|r| r.sections.find(b"s").map(|s| s.data().to_vec()));
        assert_eq!(data.as_deref(), Some(&b"abcdXYZ"[..]));
    }
    assert_eq!(
        read_all(&mut cluster, "n2", b, ckpt_b, b"s")?,
        Ok(ReplyData::Data(b"abcdXYZ".to_vec()))
    );
    assert_eq!(
        cluster.call(
            "n1",
            a,
            ClientCall::Read {
                ckpt: ckpt_a,
                id: b"s".to_vec(),
                offset: 7,
                size: 1,
            },
        )?,
        Err(CkptError::FailedOperation)
    );
    assert_eq!(
        read_all(&mut cluster, "n1", a, ckpt_a, b"none")?,
        Err(CkptError::NotExist)
    );
    Ok(())
}

#[test]
fn oversized_overwrite_rejected() -> Result<(), CheckpointdError> {
    let (mut cluster, (a, ckpt_a), (b, ckpt_b)) =
        replicated(CreationFlags::WriteAllReplicas)?;
    assert_eq!(
        cluster.call(
            "n1",
            a,
            ClientCall::SectionCreate {
                ckpt: ckpt_a,
                id: b"s1".to_vec(),
                expiration: TIME_END,
                data: b"thirteen byte".to_vec(),
            },
        )?,
        Ok(ReplyData::Done)
    );

    let overwrite = |len: usize| ClientCall::Overwrite {
        ckpt: ckpt_a,
        id: b"s1".to_vec(),
        data: vec![7; len],
    };
    assert_eq!(cluster.call("n1", a, overwrite(20))?, Ok(ReplyData::Done));
    assert_eq!(
        read_all(&mut cluster, "n1", a, ckpt_a, b"s1")?,
        Ok(ReplyData::Data(vec![7; 20]))
    );
    assert_eq!(
        cluster.call("n1", a, overwrite(101))?,
        Err(CkptError::FailedOperation)
    );

    // content and section count (default section plus "s1") untouched on
    // every replica
    assert_eq!(
        read_all(&mut cluster, "n2", b, ckpt_b, b"s1")?,
        Ok(ReplyData::Data(vec![7; 20]))
    );
    for node in ["n1", "n2"] {
        let replica = cluster.service(node)?.replica("c");
        assert!(replica.is_some_and(|r| r.sections.count() == 2 && !r.locked));
    }
    Ok(())
}

#[test]
fn active_replica_push() -> Result<(), CheckpointdError> {
    let (mut cluster, (a, ckpt_a), (b, ckpt_b)) =
        replicated(CreationFlags::WriteActiveReplica)?;
    assert_eq!(
        cluster.call(
            "n2",
            b,
            ClientCall::SectionCreate {
                ckpt: ckpt_b,
                id: b"p".to_vec(),
                expiration: TIME_END,
                data: b"one".to_vec(),
            },
        )?,
        Ok(ReplyData::Done)
    );
    assert_eq!(
        cluster.call(
            "n1",
            a,
            ClientCall::Overwrite {
                ckpt: ckpt_a,
                id: b"p".to_vec(),
                data: b"two".to_vec(),
            },
        )?,
        Ok(ReplyData::Done)
    );

    // the standby caught up through the unacknowledged push
    let standby = cluster
        .service("n2")?
        .replica("c")
        .and_then(|r| r.sections.find(b"p").map(|s| s.data().to_vec()));
    assert_eq!(standby.as_deref(), Some(&b"two"[..]));

    assert_eq!(
        cluster.call("n2", b, ClientCall::Synchronize { ckpt: ckpt_b })?,
        Ok(ReplyData::Done)
    );
    let standby = cluster.service("n2")?.replica("c");
    assert!(standby.is_some_and(|r| r.sections.count() == 2 && !r.locked));
    Ok(())
}

#[test]
fn query_delete_and_status() -> Result<(), CheckpointdError> {
    let (mut cluster, (a, ckpt_a), (b, ckpt_b)) =
        replicated(CreationFlags::WriteAllReplicas)?;
    for (id, expiration) in [(&b"x"[..], TIME_END), (&b"y"[..], 1000)] {
        assert_eq!(
            cluster.call(
                "n1",
                a,
                ClientCall::SectionCreate {
                    ckpt: ckpt_a,
                    id: id.to_vec(),
                    expiration,
                    data: b"data".to_vec(),
                },
            )?,
            Ok(ReplyData::Done)
        );
    }
    let dup = ClientCall::SectionCreate {
        ckpt: ckpt_b,
        id: b"x".to_vec(),
        expiration: TIME_END,
        data: vec![],
    };
    assert_eq!(cluster.call("n2", b, dup)?, Err(CkptError::Exist));

    match cluster.call(
        "n2",
        b,
        ClientCall::SectionQuery {
            ckpt: ckpt_b,
            chosen: SectionsChosen::Forever,
            expiration: 0,
        },
    )? {
        Ok(ReplyData::Sections(descs)) => {
            // the default section never expires either
            let ids: Vec<&[u8]> = descs.iter().map(|d| &d.id[..]).collect();
            assert_eq!(ids, vec![&b""[..], &b"x"[..]]);
        }
        other => {
            return Err(CheckpointdError::msg(format!("query gave {:?}", other)))
        }
    }

    assert_eq!(
        cluster.call(
            "n2",
            b,
            ClientCall::SectionDelete {
                ckpt: ckpt_b,
                id: b"x".to_vec(),
            },
        )?,
        Ok(ReplyData::Done)
    );
    match cluster.call("n1", a, ClientCall::StatusGet { ckpt: ckpt_a })? {
        Ok(ReplyData::Status(status)) => {
            assert_eq!(status.number_of_sections, 2);
            assert_eq!(status.memory_used, 4);
            assert_eq!(status.attrs.max_sections, 4);
        }
        other => {
            return Err(CheckpointdError::msg(format!("status gave {:?}", other)))
        }
    }
    Ok(())
}

#[test]
fn access_checked_against_open_mode() -> Result<(), CheckpointdError> {
    let (mut cluster, (a, ckpt_a), _) =
        replicated(CreationFlags::WriteAllReplicas)?;
    let reader = cluster.init_client("n1")?;
    let ckpt_r = cluster.open("n1", reader, "c", OpenFlags::READ, None)?;
    let create = |ckpt| ClientCall::SectionCreate {
        ckpt,
        id: b"s".to_vec(),
        expiration: TIME_END,
        data: b"z".to_vec(),
    };
    assert_eq!(cluster.call("n1", reader, create(ckpt_r))?, Err(CkptError::Access));
    assert_eq!(cluster.call("n1", a, create(ckpt_a))?, Ok(ReplyData::Done));
    assert_eq!(
        read_all(&mut cluster, "n1", reader, ckpt_r, b"s")?,
        Ok(ReplyData::Data(b"z".to_vec()))
    );

    // handles belong to the client that opened them
    assert_eq!(
        read_all(&mut cluster, "n1", reader, ckpt_a, b"s")?,
        Err(CkptError::BadHandle)
    );
    Ok(())
}
