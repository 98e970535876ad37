use pw_bridge_protocol::{PersistedState, SnapshotRecord};

use super::*;

fn connecting(table: &mut SessionTable, target: u64) -> SessionId {
	let (session_id, order) = table.allocate();
	table.put(Session {
		session_id: session_id.clone(),
		target: TargetId(target),
		protocol_target_id: format!("T{target}"),
		attach_order: order,
		attached_at_ms: 1_000 + order,
		url: format!("https://site-{target}.test/"),
		title: format!("Site {target}"),
		state: SessionState::Connecting,
	});
	session_id
}

fn connected(table: &mut SessionTable, target: u64) -> SessionId {
	let id = connecting(table, target);
	assert!(table.mark_connected(TargetId(target)));
	id
}

#[test]
fn allocate_never_reuses_ids() {
	let mut table = SessionTable::new();
	let first = connected(&mut table, 1);
	table.remove(TargetId(1));
	let second = connected(&mut table, 1);
	assert_eq!(first.as_str(), "pw-tab-1");
	assert_eq!(second.as_str(), "pw-tab-2");
}

#[test]
fn lookups_agree_in_both_directions() {
	let mut table = SessionTable::new();
	let a = connected(&mut table, 10);
	let b = connected(&mut table, 20);

	assert_eq!(table.get_by_session(a.as_str()).map(|s| s.target), Some(TargetId(10)));
	assert_eq!(table.get(TargetId(20)).map(|s| s.session_id.clone()), Some(b));
	assert_eq!(table.find_by_protocol_id("T10"), Some(TargetId(10)));
	assert!(table.is_consistent());
}

#[test]
fn remove_drops_both_indices_and_children() {
	let mut table = SessionTable::new();
	let id = connected(&mut table, 5);
	assert!(table.add_child(TargetId(5), "child-b"));
	assert!(table.add_child(TargetId(5), "child-a"));

	let removed = table.remove(TargetId(5)).unwrap();
	assert_eq!(removed.session.session_id, id);
	assert_eq!(removed.children, vec!["child-a".to_string(), "child-b".to_string()]);
	assert!(table.get_by_session(id.as_str()).is_none());
	assert!(table.resolve_session("child-a").is_none());
	assert!(table.is_empty());
	assert!(table.is_consistent());
}

#[test]
fn children_require_known_parent() {
	let mut table = SessionTable::new();
	assert!(!table.add_child(TargetId(1), "orphan"));
	connected(&mut table, 1);
	assert!(table.add_child(TargetId(1), "kid"));
	assert_eq!(
		table.resolve_session("kid"),
		Some(Resolved {
			target: TargetId(1),
			child_session: Some("kid".into())
		})
	);
	assert_eq!(table.remove_child("kid"), Some(TargetId(1)));
	assert!(table.resolve_session("kid").is_none());
}

#[test]
fn mark_connected_happens_once() {
	let mut table = SessionTable::new();
	connecting(&mut table, 3);
	assert!(table.list_connected().is_empty());
	assert!(table.mark_connected(TargetId(3)));
	assert!(!table.mark_connected(TargetId(3)));
	assert_eq!(table.list_connected().len(), 1);
}

#[test]
fn snapshot_contains_only_connected_sessions() {
	let mut table = SessionTable::new();
	connected(&mut table, 1);
	connecting(&mut table, 2);
	connected(&mut table, 3);

	let snapshot = table.snapshot();
	let tabs: Vec<u64> = snapshot.persisted_tabs.iter().map(|r| r.tab_id).collect();
	assert_eq!(tabs, vec![1, 3]);
	assert_eq!(snapshot.next_session, 4);
}

#[test]
fn snapshot_restore_round_trip() {
	let mut table = SessionTable::new();
	connected(&mut table, 1);
	connected(&mut table, 2);
	let snapshot = table.snapshot();

	let mut fresh = SessionTable::new();
	let restored = fresh.restore(snapshot.clone());
	assert_eq!(restored, vec![TargetId(1), TargetId(2)]);
	assert_eq!(fresh.snapshot(), snapshot);
	assert_eq!(fresh.get(TargetId(2)).map(|s| s.state), Some(SessionState::Connected));

	let (next, _) = fresh.allocate();
	assert_eq!(next.as_str(), "pw-tab-3");
}

#[test]
fn restore_seeds_counter_past_highest_order() {
	let mut table = SessionTable::new();
	table.restore(PersistedState {
		persisted_tabs: vec![SnapshotRecord {
			tab_id: 9,
			session_id: "pw-tab-41".into(),
			target_id: "T9".into(),
			attach_order: 0,
		}],
		next_session: 7,
	});
	assert_eq!(table.get(TargetId(9)).map(|s| s.attach_order), Some(41));
	assert_eq!(table.next_session(), 42);
}

#[test]
fn restore_skips_duplicates() {
	let mut table = SessionTable::new();
	let record = SnapshotRecord {
		tab_id: 1,
		session_id: "pw-tab-1".into(),
		target_id: "T1".into(),
		attach_order: 1,
	};
	let restored = table.restore(PersistedState {
		persisted_tabs: vec![
			record.clone(),
			SnapshotRecord {
				tab_id: 2,
				..record.clone()
			},
		],
		next_session: 2,
	});
	assert_eq!(restored, vec![TargetId(1)]);
	assert!(table.is_consistent());
}

#[test]
fn rekey_moves_session_and_children() {
	let mut table = SessionTable::new();
	let id = connected(&mut table, 1);
	table.add_child(TargetId(1), "kid");

	assert!(table.rekey(TargetId(1), TargetId(2)));
	assert!(table.get(TargetId(1)).is_none());
	assert_eq!(table.get_by_session(id.as_str()).map(|s| s.target), Some(TargetId(2)));
	assert_eq!(table.resolve_session("kid").map(|r| r.target), Some(TargetId(2)));
	assert!(table.is_consistent());

	assert!(!table.rekey(TargetId(7), TargetId(8)));
}

#[test]
fn first_connected_uses_attach_order() {
	let mut table = SessionTable::new();
	connecting(&mut table, 100);
	connected(&mut table, 50);
	connected(&mut table, 10);
	assert_eq!(table.first_connected().map(|s| s.target), Some(TargetId(50)));
	let order: Vec<u64> = table.list_connected().iter().map(|s| s.target.0).collect();
	assert_eq!(order, vec![50, 10]);
}

#[test]
fn put_with_claimed_session_id_evicts_previous_owner() {
	let mut table = SessionTable::new();
	let id = connected(&mut table, 1);
	table.put(Session {
		session_id: id.clone(),
		target: TargetId(2),
		protocol_target_id: "T2".into(),
		attach_order: 1,
		attached_at_ms: 0,
		url: String::new(),
		title: String::new(),
		state: SessionState::Connected,
	});
	assert!(table.get(TargetId(1)).is_none());
	assert_eq!(table.get_by_session(id.as_str()).map(|s| s.target), Some(TargetId(2)));
	assert!(table.is_consistent());
}

#[test]
fn metadata_updates_cached_fields() {
	let mut table = SessionTable::new();
	connected(&mut table, 1);
	assert!(table.update_metadata(TargetId(1), Some("https://new.test/"), None));
	let session = table.get(TargetId(1)).unwrap();
	assert_eq!(session.url, "https://new.test/");
	assert_eq!(session.title, "Site 1");
	assert!(!table.update_metadata(TargetId(9), Some("x"), None));
}

#[test]
fn random_operation_sequences_stay_consistent() {
	let mut table = SessionTable::new();
	for step in 0u64..500 {
		let target = (step * 7919) % 13;
		match step % 6 {
			0 | 1 => {
				if !table.contains(TargetId(target)) {
					connected(&mut table, target);
				}
			}
			2 => {
				table.remove(TargetId(target));
			}
			3 => {
				table.add_child(TargetId(target), format!("child-{step}"));
			}
			4 => {
				table.rekey(TargetId(target), TargetId((target + 1) % 13));
			}
			_ => {
				let snapshot = table.snapshot();
				let mut copy = SessionTable::new();
				copy.restore(snapshot.clone());
				assert_eq!(copy.snapshot().persisted_tabs, snapshot.persisted_tabs);
			}
		}
		assert!(table.is_consistent(), "inconsistent after step {step}");
	}
}
