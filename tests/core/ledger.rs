#[path = "../support/mod.rs"]
mod support;

use rusqlite::{Connection, params};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;
use verdict::core::broker::BrokerEvent;
use verdict::core::case_ref;
use verdict::core::chain::{Chained, GENESIS};
use verdict::core::error::VerdictError;
use verdict::core::ledger::{AuditLedger, LedgerEntry, NewEntry};
use verdict::core::pipeline::CancelToken;
use verdict::core::schemas;
use verdict::core::signoff::{SignOff, SignOffMethod};
use verdict::core::store::Store;

fn open(root: &std::path::Path) -> AuditLedger {
    AuditLedger::open(&Store::open(root).expect("store")).expect("ledger")
}

fn entry(raw_id: &str, actor: &str) -> NewEntry {
    NewEntry {
        case_reference: case_ref::pseudonymize(raw_id, "test-salt").unwrap(),
        actor: actor.to_string(),
        mode: "chain".to_string(),
        model_identifiers: vec!["model-a".to_string()],
        run_hash: "ab".repeat(32),
        signoff_hash: None,
    }
}

/// Direct access an attacker with the database file would have.
fn raw_conn(ledger: &AuditLedger) -> Connection {
    let conn = Connection::open(ledger.db_path()).expect("raw open");
    conn.execute_batch(
        "DROP TRIGGER IF EXISTS ledger_entries_no_update;
         DROP TRIGGER IF EXISTS ledger_entries_no_delete;",
    )
    .expect("drop guards");
    conn
}

#[test]
fn n_appends_give_length_n_and_verify() {
    let tmp = tempdir().unwrap();
    let ledger = open(tmp.path());
    assert!(ledger.is_empty().unwrap());
    assert!(ledger.verify_ledger().unwrap().valid);

    for i in 0..10 {
        let e = ledger.append(entry(&format!("MRN-{}", i), "dr-a")).unwrap();
        assert_eq!(e.sequence_id, i + 1);
        assert_eq!(ledger.len().unwrap(), i + 1);
    }
    let entries = ledger.entries().unwrap();
    assert_eq!(entries[0].prev_hash(), GENESIS);
    for pair in entries.windows(2) {
        assert_eq!(pair[1].prev_entry_hash, pair[0].entry_hash);
    }
    let verdict = ledger.verify_ledger().unwrap();
    assert!(verdict.valid);
    assert_eq!(verdict.checked, 10);
    // repeated verification of an untouched ledger stays valid
    assert_eq!(ledger.verify_ledger().unwrap(), verdict);
}

#[test]
fn concurrent_appends_serialise_into_one_chain() {
    const M: usize = 8;
    let tmp = tempdir().unwrap();
    let ledger = Arc::new(open(tmp.path()));
    let barrier = Arc::new(Barrier::new(M));

    let handles: Vec<_> = (0..M)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                ledger
                    .append(entry(&format!("MRN-C{}", i), &format!("dr-{}", i)))
                    .expect("append")
            })
        })
        .collect();
    let appended: Vec<LedgerEntry> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(ledger.len().unwrap(), M as u64);
    assert!(ledger.verify_ledger().unwrap().valid);
    let mut seqs: Vec<u64> = appended.iter().map(|e| e.sequence_id).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=M as u64).collect::<Vec<_>>());
}

#[test]
fn separate_handles_on_one_store_do_not_fork() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().to_path_buf();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let root = root.clone();
            thread::spawn(move || {
                let ledger = open(&root);
                for j in 0..3 {
                    ledger
                        .append(entry(&format!("MRN-{}-{}", i, j), "dr-x"))
                        .expect("append");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let ledger = open(&root);
    assert_eq!(ledger.len().unwrap(), 12);
    assert!(ledger.verify_ledger().unwrap().valid);
}

#[test]
fn verification_while_appending_never_reports_a_break() {
    const APPENDS: usize = 200;
    let tmp = tempdir().unwrap();
    let ledger = Arc::new(open(tmp.path()));
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let ledger = Arc::clone(&ledger);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for i in 0..APPENDS {
                ledger
                    .append(entry(&format!("MRN-W{}", i), "dr-w"))
                    .expect("append");
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    loop {
        let finished = done.load(Ordering::SeqCst);
        let verdict = ledger.verify_ledger().unwrap();
        assert!(verdict.valid, "healthy ledger reported broken: {:?}", verdict.reason);
        if finished {
            assert_eq!(verdict.checked, APPENDS);
            break;
        }
    }
    writer.join().unwrap();
}

#[test]
fn stale_tail_is_a_concurrency_violation_and_append_recovers() {
    let tmp = tempdir().unwrap();
    let ledger = open(tmp.path());

    // both writers read the empty tail
    let loser_draft = entry("MRN-LOSER", "dr-loser");
    let stale = LedgerEntry::link(&loser_draft, None, "2025-01-01T00:00:00.000Z").unwrap();

    let winner = ledger.append(entry("MRN-WINNER", "dr-winner")).unwrap();
    assert_eq!(winner.sequence_id, 1);

    let err = ledger.compare_and_append(&stale, GENESIS).unwrap_err();
    match err {
        VerdictError::ConcurrencyViolation { expected, actual } => {
            assert_eq!(expected, GENESIS);
            assert_eq!(actual, winner.entry_hash);
        }
        other => panic!("expected concurrency violation, got {other}"),
    }
    assert_eq!(ledger.len().unwrap(), 1);

    let retried = ledger.append(loser_draft).unwrap();
    assert_eq!(retried.sequence_id, 2);
    assert_eq!(retried.prev_entry_hash, winner.entry_hash);
    assert_eq!(ledger.len().unwrap(), 2);
    assert!(ledger.verify_ledger().unwrap().valid);

    let journal: Vec<BrokerEvent> = ledger.broker().events().unwrap();
    assert!(journal.iter().any(|ev| ev.op == "ledger.append" && ev.status == "conflict"));
}

#[test]
fn forged_entry_is_refused_without_touching_the_ledger() {
    let tmp = tempdir().unwrap();
    let ledger = open(tmp.path());
    let mut forged = LedgerEntry::link(&entry("MRN-1", "dr-a"), None, "t").unwrap();
    forged.actor = "dr-mallory".to_string();
    assert!(matches!(
        ledger.compare_and_append(&forged, GENESIS),
        Err(VerdictError::ValidationError(_))
    ));
    assert_eq!(ledger.len().unwrap(), 0);
}

#[test]
fn storage_refuses_update_and_delete() {
    let tmp = tempdir().unwrap();
    let ledger = open(tmp.path());
    ledger.append(entry("MRN-1", "dr-a")).unwrap();
    let conn = Connection::open(ledger.db_path()).unwrap();
    assert!(
        conn.execute("UPDATE ledger_entries SET actor = 'x'", [])
            .is_err()
    );
    assert!(conn.execute("DELETE FROM ledger_entries", []).is_err());
    assert_eq!(ledger.len().unwrap(), 1);
}

#[test]
fn direct_edit_is_detected_at_the_edited_sequence() {
    let tmp = tempdir().unwrap();
    let ledger = open(tmp.path());
    for i in 0..5 {
        ledger.append(entry(&format!("MRN-{}", i), "dr-a")).unwrap();
    }
    let conn = raw_conn(&ledger);
    conn.execute(
        "UPDATE ledger_entries SET actor = ?1 WHERE sequence_id = 3",
        params!["dr-mallory"],
    )
    .unwrap();

    let verdict = ledger.verify_ledger().unwrap();
    assert!(!verdict.valid);
    assert_eq!(verdict.first_invalid_index, Some(2));
    let err = verdict.into_result().unwrap_err();
    assert!(err.to_string().starts_with("verification failed at index 2"));
}

#[test]
fn dropped_tail_entry_is_detected() {
    let tmp = tempdir().unwrap();
    let ledger = open(tmp.path());
    for i in 0..3 {
        ledger.append(entry(&format!("MRN-{}", i), "dr-a")).unwrap();
    }
    raw_conn(&ledger)
        .execute("DELETE FROM ledger_entries WHERE sequence_id = 3", [])
        .unwrap();
    let verdict = ledger.verify_ledger().unwrap();
    assert!(!verdict.valid);
    assert_eq!(verdict.first_invalid_index, Some(2));
}

#[test]
fn commit_decision_links_run_and_signoff() {
    let tmp = tempdir().unwrap();
    let ledger = open(tmp.path());
    let case = support::case("MRN-42");
    let run = support::scenario_pipeline().run(&case, &CancelToken::new());
    let note = "Approved: proceed with 5 mg.";
    let signoff = SignOff::approve("dr-house", note, SignOffMethod::Pin).unwrap();

    let committed = ledger.commit_decision(&run, &signoff, "chain").unwrap();
    assert_eq!(committed.run_hash, run.head_hash());
    assert_eq!(committed.signoff_hash.as_deref(), Some(signoff.signature_hash.as_str()));
    assert_eq!(committed.actor, "dr-house");
    assert_eq!(committed.model_identifiers, vec!["model-a"]);
    assert!(signoff.verify(note));

    let history = ledger.entries_for_case(&case.case_reference, 10).unwrap();
    assert_eq!(history, vec![committed]);
    assert!(ledger.entries_for_case("case-none", 10).unwrap().is_empty());
}

#[test]
fn failed_run_cannot_be_committed() {
    let tmp = tempdir().unwrap();
    let ledger = open(tmp.path());
    let cancel = CancelToken::new();
    cancel.cancel();
    let run = support::scenario_pipeline().run(&support::case("MRN-43"), &cancel);
    let signoff = SignOff::approve("dr-a", "n", SignOffMethod::Pin).unwrap();
    assert!(matches!(
        ledger.commit_decision(&run, &signoff, "chain"),
        Err(VerdictError::ValidationError(_))
    ));
    assert_eq!(ledger.len().unwrap(), 0);
}

#[test]
fn history_is_newest_first_and_limited() {
    let tmp = tempdir().unwrap();
    let ledger = open(tmp.path());
    for _ in 0..4 {
        ledger.append(entry("MRN-7", "dr-a")).unwrap();
        ledger.append(entry("MRN-8", "dr-b")).unwrap();
    }
    let reference = case_ref::pseudonymize("MRN-7", "test-salt").unwrap();
    let history = ledger.entries_for_case(&reference, 3).unwrap();
    let seqs: Vec<u64> = history.iter().map(|e| e.sequence_id).collect();
    assert_eq!(seqs, vec![7, 5, 3]);

    let range = ledger.entries_range(2, 4).unwrap();
    assert_eq!(range.iter().map(|e| e.sequence_id).collect::<Vec<_>>(), vec![2, 3, 4]);
    assert!(ledger.entries_range(4, 2).is_err());
}

#[test]
fn every_operation_lands_in_the_journal() {
    let tmp = tempdir().unwrap();
    let ledger = open(tmp.path());
    ledger.append(entry("MRN-1", "dr-a")).unwrap();
    ledger.verify_ledger().unwrap();

    let journal = tmp.path().join(schemas::LEDGER_JOURNAL_NAME);
    assert!(journal.exists());
    let events = ledger.broker().events().unwrap();
    assert!(events.iter().any(|e| e.op == "ledger.init"));
    assert!(
        events
            .iter()
            .any(|e| e.op == "ledger.append" && e.actor == "dr-a" && e.status == "success")
    );
    assert!(events.iter().any(|e| e.op == "ledger.verify"));
    assert!(events.iter().all(|e| e.db_id == schemas::LEDGER_DB_NAME));
}
