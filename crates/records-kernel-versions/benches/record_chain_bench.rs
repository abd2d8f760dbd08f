use std::path::Path;

use criterion::{criterion_group, criterion_main, Criterion};
use records_kernel_core::{
    Aspect, NodeRef, NodeStore, Privilege, Properties, PropertyKey, RoleCapabilityGate, TypeTag,
    Value, VersionCreationParams,
};
use records_kernel_store_sqlite::SqliteStore;
use records_kernel_versions::{record_chain, RecordableVersionService, VersioningSettings};

const CHAIN_LENGTH: usize = 200;

type Seeded = (SqliteStore, NodeRef, NodeRef);

fn seeded_store(service: &RecordableVersionService) -> anyhow::Result<Seeded> {
    let mut store = SqliteStore::open(Path::new(":memory:"))?;
    store.migrate()?;
    let (document, newest) = store.transaction(|tx| {
        let file_plan = tx.create_node(
            None,
            TypeTag::FilePlan,
            &[],
            Properties::from([(PropertyKey::SiteId, Value::from("rm"))]),
        )?;
        tx.create_node(Some(file_plan), TypeTag::UnfiledRecordContainer, &[], Properties::new())?;
        let document = tx.create_node(
            None,
            TypeTag::Content,
            &[Aspect::Versionable, Aspect::RecordableVersionable],
            Properties::from([
                (PropertyKey::Content, Value::from("bench")),
                (PropertyKey::RecordableVersionPolicy, Value::from("ALL")),
            ]),
        )?;
        let mut newest = None;
        for _ in 0..CHAIN_LENGTH {
            let outcome = service.create_version(
                tx,
                document,
                &VersionCreationParams::default(),
                &Privilege::System,
            )?;
            newest = outcome.record.or(newest);
        }
        let newest = newest.ok_or_else(|| anyhow::anyhow!("no record was materialized"))?;
        Ok((document, newest))
    })?;
    Ok((store, document, newest))
}

fn bench_chain(c: &mut Criterion) {
    let service =
        RecordableVersionService::new(RoleCapabilityGate::default(), VersioningSettings::default());
    let (mut store, document, newest) = match seeded_store(&service) {
        Ok(seeded) => seeded,
        Err(err) => panic!("record chain benchmark fixture failed: {err}"),
    };

    c.bench_function("record_chain_walk_200_records", |b| {
        b.iter(|| {
            let walked = store.transaction(|tx| Ok(record_chain(&*tx, newest)?));
            if let Err(err) = walked {
                panic!("record chain walk failed: {err}");
            }
        });
    });

    c.bench_function("recorded_version_on_growing_chain", |b| {
        b.iter(|| {
            let created = store.transaction(|tx| {
                Ok(service.create_version(
                    tx,
                    document,
                    &VersionCreationParams::default(),
                    &Privilege::System,
                )?)
            });
            if let Err(err) = created {
                panic!("recorded version creation failed: {err}");
            }
        });
    });
}

criterion_group!(record_chain_benches, bench_chain);
criterion_main!(record_chain_benches);
