//! Facility-scope scenarios through the policy enforcement point.
//!
//! - U scoped to F1 only: A1 (F1) visible, A2 (F2) not.
//! - Admin sees A2; the same admin against another tenant's row is refused.
//! - Scope is inherited transitively through parent chains.
//! - Revoking a scope takes effect on the next call.

use lock_tests::{child_draft, facility_draft, init_tracing, TenantWorld};
use mrv_access::audit_log::AccessDecision;
use mrv_access::context::{FacilityId, SessionContext, TenantId, UserId};
use mrv_access::entity::{chain_depth, EntityType, MAX_OWNERSHIP_HOPS};
use mrv_access::error::{AccessError, DenyReason};
use mrv_access::pep::EntityDraft;
use mrv_access::resolver::Ownership;
use mrv_access::scope_store::ScopeRole;
use serde_json::json;

#[test]
fn scoped_user_sees_f1_not_f2() {
    init_tracing();
    let w = TenantWorld::default();
    let a1 = w
        .pep
        .insert(&w.admin, facility_draft(EntityType::ActivityRecord, w.f1, json!({"qty": 1})))
        .unwrap();
    let a2 = w
        .pep
        .insert(&w.admin, facility_draft(EntityType::ActivityRecord, w.f2, json!({"qty": 2})))
        .unwrap();

    assert!(w.pep.can_access(&w.consultant, EntityType::ActivityRecord, a1).unwrap());
    assert!(!w.pep.can_access(&w.consultant, EntityType::ActivityRecord, a2).unwrap());

    let err = w.pep.read(&w.consultant, EntityType::ActivityRecord, a2).unwrap_err();
    assert_eq!(
        err.deny_reason(),
        Some(&DenyReason::NoActiveScope { facility: w.f2 })
    );
    let listed = w.pep.list(&w.consultant, EntityType::ActivityRecord).unwrap();
    assert_eq!(listed.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a1]);
}

#[test]
fn admin_bypasses_scope_but_not_tenant() {
    init_tracing();
    let w = TenantWorld::default();
    let other = TenantWorld::default();
    let a2 = w
        .pep
        .insert(&w.admin, facility_draft(EntityType::ActivityRecord, w.f2, json!({})))
        .unwrap();

    assert!(w.pep.can_access(&w.admin, EntityType::ActivityRecord, a2).unwrap());
    w.pep.read(&w.admin, EntityType::ActivityRecord, a2).unwrap();

    let foreign_admin = SessionContext::new(other.admin.tenant_id, UserId::new_v4(), ["admin"]);
    for err in [
        w.pep.can_access(&foreign_admin, EntityType::ActivityRecord, a2).unwrap_err(),
        w.pep.read(&foreign_admin, EntityType::ActivityRecord, a2).unwrap_err(),
        w.pep.delete(&foreign_admin, EntityType::ActivityRecord, a2).unwrap_err(),
    ] {
        assert!(
            matches!(
                err,
                AccessError::Forbidden {
                    reason: DenyReason::TenantMismatch { .. }
                }
            ),
            "{err}"
        );
    }
    assert!(w.pep.list(&foreign_admin, EntityType::ActivityRecord).unwrap().is_empty());
    w.pep.read(&w.admin, EntityType::ActivityRecord, a2).unwrap();

    let log = w.pep.audit_log();
    assert!(!log.admin_bypasses(&w.admin).unwrap().is_empty());
    assert!(log
        .entries(&w.admin)
        .unwrap()
        .iter()
        .all(|e| e.tenant_id == w.admin.tenant_id));
    let foreign_view = log.entries(&foreign_admin).unwrap();
    assert!(foreign_view
        .iter()
        .all(|e| e.tenant_id == foreign_admin.tenant_id));
    assert_eq!(
        foreign_view
            .iter()
            .filter(|e| matches!(e.decision, AccessDecision::Denied { .. }))
            .count(),
        3
    );
    assert!(log.entries(&w.consultant).is_err());
    log.verify_chain().unwrap();
}

#[test]
fn scope_is_inherited_through_the_whole_chain() {
    let w = TenantWorld::default();
    let insert = |draft: EntityDraft| w.pep.insert(&w.admin, draft).unwrap();

    let case1 = insert(facility_draft(EntityType::VerificationCase, w.f1, json!({})));
    let finding1 = insert(child_draft(
        EntityType::VerificationFinding,
        case1,
        json!({"severity": "minor"}),
    ));
    let action1 = insert(child_draft(
        EntityType::CorrectiveAction,
        finding1,
        json!({"due": "2026-06"}),
    ));

    let case2 = insert(facility_draft(EntityType::VerificationCase, w.f2, json!({})));
    let finding2 = insert(child_draft(EntityType::VerificationFinding, case2, json!({})));
    let action2 = insert(child_draft(EntityType::CorrectiveAction, finding2, json!({})));

    assert_eq!(chain_depth(EntityType::CorrectiveAction), 2);
    assert!(chain_depth(EntityType::CorrectiveAction) < MAX_OWNERSHIP_HOPS);

    let row = w.pep.read(&w.consultant, EntityType::CorrectiveAction, action1).unwrap();
    assert_eq!(
        w.pep.resolver().resolve_owner(&w.consultant, &row).unwrap(),
        Ownership::Facility(w.f1)
    );
    assert!(w.pep.can_access(&w.consultant, EntityType::CorrectiveAction, action1).unwrap());
    assert!(!w.pep.can_access(&w.consultant, EntityType::CorrectiveAction, action2).unwrap());

    // Children of an out-of-scope parent cannot be created either.
    let err = w
        .pep
        .insert(&w.consultant, child_draft(EntityType::CorrectiveAction, finding2, json!({})))
        .unwrap_err();
    assert!(matches!(err, AccessError::Forbidden { .. }));
}

#[test]
fn activity_details_follow_their_activity() {
    let w = TenantWorld::default();
    for detail in [
        EntityType::FuelActivity,
        EntityType::ElectricityActivity,
        EntityType::ProcessActivity,
    ] {
        let a1 = w
            .pep
            .insert(&w.consultant, facility_draft(EntityType::ActivityRecord, w.f1, json!({})))
            .unwrap();
        let d1 = w.pep.insert(&w.consultant, child_draft(detail, a1, json!({}))).unwrap();
        let a2 = w
            .pep
            .insert(&w.admin, facility_draft(EntityType::ActivityRecord, w.f2, json!({})))
            .unwrap();
        let d2 = w.pep.insert(&w.admin, child_draft(detail, a2, json!({}))).unwrap();
        assert!(w.pep.can_access(&w.consultant, detail, d1).unwrap(), "{detail}");
        assert!(!w.pep.can_access(&w.consultant, detail, d2).unwrap(), "{detail}");
    }
}

#[test]
fn report_lines_are_scoped_only_when_attributed() {
    let w = TenantWorld::default();
    let unattributed = EntityDraft {
        entity_type: EntityType::ReportLine,
        facility_id: None,
        parent_id: None,
        data: json!({"cn_code": "2523 10 00"}),
    };
    let line = w.pep.insert(&w.consultant, unattributed).unwrap();
    let row = w.pep.read(&w.consultant, EntityType::ReportLine, line).unwrap();
    assert_eq!(
        w.pep.resolver().resolve_owner(&w.consultant, &row).unwrap(),
        Ownership::Unattributed
    );

    let in_f2 = w
        .pep
        .insert(&w.admin, facility_draft(EntityType::ReportLine, w.f2, json!({})))
        .unwrap();
    assert!(!w.pep.can_access(&w.consultant, EntityType::ReportLine, in_f2).unwrap());
    assert!(w
        .pep
        .insert(&w.consultant, facility_draft(EntityType::ReportLine, w.f2, json!({})))
        .is_err());
}

#[test]
fn compliance_checks_are_tenant_wide() {
    let w = TenantWorld::default();
    let check = w
        .pep
        .insert(
            &w.admin,
            EntityDraft {
                entity_type: EntityType::ComplianceCheck,
                facility_id: None,
                parent_id: None,
                data: json!({"rule": "cbam.default_values.share"}),
            },
        )
        .unwrap();
    let unscoped = w.session(&["consultant"]);
    assert!(w.pep.can_access(&unscoped, EntityType::ComplianceCheck, check).unwrap());
    let outsider = TenantWorld::default();
    assert!(w.pep.can_access(&outsider.admin, EntityType::ComplianceCheck, check).is_err());
}

#[test]
fn revoked_scope_denies_next_call() {
    let w = TenantWorld::default();
    let a1 = w
        .pep
        .insert(&w.consultant, facility_draft(EntityType::ActivityRecord, w.f1, json!({})))
        .unwrap();
    assert!(w.pep.can_access(&w.consultant, EntityType::ActivityRecord, a1).unwrap());
    w.scopes.revoke(&w.admin, w.consultant.user_id, w.f1).unwrap();
    assert!(!w.pep.can_access(&w.consultant, EntityType::ActivityRecord, a1).unwrap());
    assert!(w
        .pep
        .update(&w.consultant, EntityType::ActivityRecord, a1, |row| row.data = json!({"x": 1}))
        .is_err());
}

#[test]
fn facility_of_another_tenant_cannot_be_referenced() {
    let w = TenantWorld::default();
    let foreign_admin = SessionContext::new(TenantId::new_v4(), UserId::new_v4(), ["admin"]);
    let foreign_facility = FacilityId::new_v4();
    w.scopes.register_facility(&foreign_admin, foreign_facility).unwrap();
    let err = w
        .pep
        .insert(&w.admin, facility_draft(EntityType::ActivityRecord, foreign_facility, json!({})))
        .unwrap_err();
    assert!(matches!(
        err,
        AccessError::Forbidden {
            reason: DenyReason::TenantMismatch { .. }
        }
    ));
    assert!(w
        .scopes
        .grant(&w.admin, w.consultant.user_id, foreign_facility, ScopeRole::Viewer)
        .is_err());
    let unknown = FacilityId::new_v4();
    assert!(w
        .pep
        .insert(&w.admin, facility_draft(EntityType::ActivityRecord, unknown, json!({})))
        .is_err());
}
