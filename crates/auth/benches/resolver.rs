use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::collections::BTreeSet;

use staybase_auth::{AccessSnapshot, ActiveOverrides, RoleScope, TenantContext, decide};
use staybase_auth::resolver::RoleGrant;
use staybase_core::{OrganizationId, PermissionId, PropertyId, RoleId, UserId};

fn permission_set(size: usize) -> Vec<PermissionId> {
    (0..size).map(|_| PermissionId::new()).collect()
}

fn bench_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("decide");

    for size in [8usize, 64, 512] {
        let ids = permission_set(size);
        let role: BTreeSet<PermissionId> = ids.iter().copied().collect();
        // Every eighth permission carries an override.
        let overrides: ActiveOverrides = ids
            .iter()
            .step_by(8)
            .enumerate()
            .map(|(i, id)| (*id, i % 2 == 0))
            .collect();
        let missing = PermissionId::new();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("role_hit", size), &size, |b, _| {
            b.iter(|| decide(black_box(ids[size - 1]), &overrides, &role))
        });
        group.bench_with_input(BenchmarkId::new("override_hit", size), &size, |b, _| {
            b.iter(|| decide(black_box(ids[0]), &overrides, &role))
        });
        group.bench_with_input(BenchmarkId::new("default_deny", size), &size, |b, _| {
            b.iter(|| decide(black_box(missing), &overrides, &role))
        });
    }

    group.finish();
}

fn bench_snapshot_check_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_check_all");

    let org = OrganizationId::new();
    let property = PropertyId::new();
    let ids = permission_set(64);
    let snapshot = AccessSnapshot {
        user_id: UserId::new(),
        role: Some(RoleGrant {
            role_id: RoleId::new(),
            name: "PROPERTY_MANAGER".into(),
            scope: RoleScope::Property {
                organization_id: org,
                property_id: property,
            },
            is_active: true,
            permissions: ids.iter().copied().collect(),
        }),
        overrides: ActiveOverrides::new(),
    };
    let ctx = TenantContext::property(org, property);

    for required in [1usize, 4, 16] {
        let keys = &ids[..required];
        group.throughput(Throughput::Elements(required as u64));
        group.bench_with_input(BenchmarkId::new("global", required), &required, |b, _| {
            b.iter(|| keys.iter().all(|id| snapshot.evaluate(black_box(*id)).allowed))
        });
        group.bench_with_input(BenchmarkId::new("within_tenant", required), &required, |b, _| {
            b.iter(|| {
                keys.iter()
                    .all(|id| snapshot.evaluate_within(black_box(*id), &ctx).allowed)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decide, bench_snapshot_check_all);
criterion_main!(benches);
