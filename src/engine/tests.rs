use super::*;
use crate::limits::*;

const H: Minutes = 60;

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2031, 3, day).unwrap()
}

fn draft(day: u32, start: Minutes, end: Minutes, master: Option<&str>) -> BookingDraft {
    BookingDraft {
        client_name: "Anna".into(),
        client_phone: "+7 912 345-67-89".into(),
        service_name: "Haircut".into(),
        master: master.map(str::to_string),
        date: date(day),
        slot: Slot::new(start, end),
        comment: String::new(),
    }
}

fn legacy(tenant: &str, day: u32, start: Minutes, master: Option<&str>) -> Booking {
    Booking {
        id: Ulid::new(),
        tenant_id: tenant.into(),
        client_name: "Old client".into(),
        client_phone: "89990001122".into(),
        service_name: "Coloring".into(),
        master: master.map(str::to_string),
        date: date(day),
        start_time: start,
        end_time: None,
        comment: String::new(),
        created_at: 0,
    }
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("salond_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn engine(name: &str) -> Engine {
    Engine::new("1", test_wal_path(name)).unwrap()
}

/// Edit that swaps in `next` whatever is stored.
fn replace(
    next: &Booking,
    recheck: bool,
) -> impl Fn(&Booking) -> Result<(Booking, bool), EngineError> + use<> {
    let next = next.clone();
    move |_| Ok((next.clone(), recheck))
}

#[tokio::test]
async fn insert_assigns_id_and_explicit_end() {
    let engine = engine("insert_assigns.wal");
    let b = engine
        .insert_booking(draft(1, 9 * H, 10 * H, Some("Alina")))
        .await
        .unwrap();

    assert_eq!(b.tenant_id, "1");
    assert_eq!(b.end_time, Some(10 * H));
    assert!(b.created_at > 0);
    assert_eq!(engine.get_booking(b.id).await, Some(b.clone()));
    assert_eq!(engine.booking_date(&b.id), Some(date(1)));
}

#[tokio::test]
async fn insert_overlap_same_master_conflicts() {
    let engine = engine("insert_overlap.wal");
    let first = engine
        .insert_booking(draft(1, 9 * H, 10 * H, Some("Alina")))
        .await
        .unwrap();

    let result = engine
        .insert_booking(draft(1, 9 * H + 30, 10 * H + 30, Some("Alina")))
        .await;
    match result {
        Err(EngineError::Conflict(summary)) => assert_eq!(summary.id, first.id),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(engine.booking_count(), 1);
}

#[tokio::test]
async fn insert_touching_and_other_master_succeed() {
    let engine = engine("insert_touching.wal");
    engine
        .insert_booking(draft(1, 9 * H, 10 * H, Some("Alina")))
        .await
        .unwrap();
    engine
        .insert_booking(draft(1, 10 * H, 11 * H, Some("Alina")))
        .await
        .unwrap();
    engine
        .insert_booking(draft(1, 9 * H, 10 * H, Some("Diana")))
        .await
        .unwrap();
    assert_eq!(engine.booking_count(), 3);
}

#[tokio::test]
async fn same_slot_on_other_date_is_free() {
    let engine = engine("other_date.wal");
    engine.insert_booking(draft(1, 9 * H, 10 * H, None)).await.unwrap();
    engine.insert_booking(draft(2, 9 * H, 10 * H, None)).await.unwrap();
    assert_eq!(engine.booking_count(), 2);
}

#[tokio::test]
async fn concurrent_inserts_for_one_slot_have_single_winner() {
    let engine = Arc::new(engine("concurrent_slot.wal"));
    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        // Mix of exact and shifted windows, all overlapping 09:30-10:00.
        let start = 9 * H + (i % 4) * 10;
        handles.push(tokio::spawn(async move {
            engine
                .insert_booking(draft(1, start, start + H, Some("Alina")))
                .await
        }));
    }

    let mut won = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(engine.list_bookings(Some(date(1))).await.len(), 1);
}

#[tokio::test]
async fn concurrent_unassigned_and_named_race() {
    let engine = Arc::new(engine("concurrent_mixed.wal"));
    let a = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.insert_booking(draft(1, 9 * H, 10 * H, None)).await })
    };
    let b = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .insert_booking(draft(1, 9 * H, 10 * H, Some("Diana")))
                .await
        })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
}

#[tokio::test]
async fn replay_restores_bookings() {
    let path = test_wal_path("replay_restore.wal");
    let (kept, moved, deleted) = {
        let engine = Engine::new("1", path.clone()).unwrap();
        let kept = engine.insert_booking(draft(1, 9 * H, 10 * H, Some("Alina"))).await.unwrap();
        let moved = engine.insert_booking(draft(1, 11 * H, 12 * H, None)).await.unwrap();
        let deleted = engine.insert_booking(draft(2, 9 * H, 10 * H, None)).await.unwrap();

        let mut target = moved.clone();
        target.date = date(3);
        engine.update_booking(target.id, replace(&target, true)).await.unwrap();
        engine.delete_booking(deleted.id).await.unwrap();
        (kept, target, deleted)
    };

    let engine = Engine::new("1", path).unwrap();
    assert_eq!(engine.booking_count(), 2);
    assert_eq!(engine.get_booking(kept.id).await, Some(kept));
    assert_eq!(engine.get_booking(moved.id).await, Some(moved.clone()));
    assert_eq!(engine.booking_date(&moved.id), Some(date(3)));
    assert!(engine.list_bookings(Some(date(1))).await.iter().all(|b| b.id != moved.id));
    assert!(engine.get_booking(deleted.id).await.is_none());
}

#[tokio::test]
async fn update_within_own_slot_excludes_itself() {
    let engine = engine("update_self.wal");
    let b = engine
        .insert_booking(draft(1, 9 * H, 10 * H, Some("Alina")))
        .await
        .unwrap();

    let mut longer = b.clone();
    longer.end_time = Some(10 * H + 30);
    let saved = engine.update_booking(b.id, replace(&longer, true)).await.unwrap();
    assert_eq!(saved.end_time, Some(10 * H + 30));
    assert_eq!(engine.get_booking(b.id).await.unwrap().end_time, Some(10 * H + 30));
}

#[tokio::test]
async fn update_into_taken_slot_conflicts_and_keeps_original() {
    let engine = engine("update_taken.wal");
    let blocker = engine
        .insert_booking(draft(1, 9 * H, 10 * H, Some("Alina")))
        .await
        .unwrap();
    let b = engine
        .insert_booking(draft(1, 12 * H, 13 * H, Some("Alina")))
        .await
        .unwrap();

    let mut earlier = b.clone();
    earlier.start_time = 9 * H + 30;
    earlier.end_time = Some(10 * H + 30);
    match engine.update_booking(b.id, replace(&earlier, true)).await {
        Err(EngineError::Conflict(summary)) => assert_eq!(summary.id, blocker.id),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(engine.get_booking(b.id).await, Some(b));
}

#[tokio::test]
async fn update_without_recheck_skips_conflict_check() {
    let engine = engine("update_no_recheck.wal");
    // Two overlapping legacy rows: only an import can produce this.
    let a = legacy("1", 1, 9 * H, None);
    let b = legacy("1", 1, 9 * H + 10, None);
    engine.import_bookings(vec![a.clone(), b.clone()]).await.unwrap();

    let mut commented = b.clone();
    commented.comment = "bring photos".into();
    engine.update_booking(b.id, replace(&commented, false)).await.unwrap();
    assert_eq!(engine.get_booking(b.id).await, Some(commented.clone()));

    assert!(matches!(
        engine.update_booking(b.id, replace(&commented, true)).await,
        Err(EngineError::Conflict(_))
    ));
}

#[tokio::test]
async fn update_moving_date_into_conflict_fails() {
    let engine = engine("update_move_conflict.wal");
    engine.insert_booking(draft(2, 9 * H, 10 * H, None)).await.unwrap();
    let b = engine.insert_booking(draft(1, 9 * H, 10 * H, None)).await.unwrap();

    let mut moved = b.clone();
    moved.date = date(2);
    assert!(matches!(
        engine.update_booking(b.id, replace(&moved, false)).await,
        Err(EngineError::Conflict(_))
    ));
    assert_eq!(engine.booking_date(&b.id), Some(date(1)));
}

#[tokio::test]
async fn update_moving_backwards_in_time() {
    let engine = engine("update_move_back.wal");
    let b = engine.insert_booking(draft(5, 9 * H, 10 * H, None)).await.unwrap();
    let mut moved = b.clone();
    moved.date = date(4);
    engine.update_booking(b.id, replace(&moved, true)).await.unwrap();

    assert!(engine.list_bookings(Some(date(5))).await.is_empty());
    assert_eq!(engine.list_bookings(Some(date(4))).await.len(), 1);
}

#[tokio::test]
async fn update_unknown_booking_not_found() {
    let engine = engine("update_unknown.wal");
    let ghost = legacy("1", 1, 9 * H, None);
    assert!(matches!(
        engine.update_booking(ghost.id, replace(&ghost, true)).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn edit_applies_to_stored_record_not_an_old_copy() {
    let engine = engine("update_stale_copy.wal");
    let x = engine
        .insert_booking(draft(1, 9 * H, 10 * H, Some("Alina")))
        .await
        .unwrap();
    let old_copy = x.clone();

    let mut later = x.clone();
    later.start_time = 11 * H;
    later.end_time = Some(12 * H);
    engine.update_booking(x.id, replace(&later, true)).await.unwrap();
    let c = engine
        .insert_booking(draft(1, 9 * H, 10 * H, Some("Alina")))
        .await
        .unwrap();

    // A comment edit computed from what is stored, not from `old_copy`.
    let saved = engine
        .update_booking(x.id, |stored| {
            let mut next = stored.clone();
            next.comment = "running late".into();
            Ok((next, false))
        })
        .await
        .unwrap();
    assert_eq!(saved.start_time, 11 * H);
    assert_eq!(saved.comment, "running late");
    assert_ne!(saved.start_time, old_copy.start_time);

    let at_nine: Vec<Ulid> = engine
        .list_bookings(Some(date(1)))
        .await
        .into_iter()
        .filter(|b| b.start_time == 9 * H && b.master.as_deref() == Some("Alina"))
        .map(|b| b.id)
        .collect();
    assert_eq!(at_nine, vec![c.id]);
}

#[tokio::test]
async fn edit_cannot_change_id_or_tenant() {
    let engine = engine("update_keeps_identity.wal");
    let b = engine.insert_booking(draft(1, 9 * H, 10 * H, None)).await.unwrap();
    let saved = engine
        .update_booking(b.id, |stored| {
            let mut next = stored.clone();
            next.id = Ulid::new();
            next.tenant_id = "2".into();
            Ok((next, false))
        })
        .await
        .unwrap();
    assert_eq!(saved.id, b.id);
    assert_eq!(saved.tenant_id, "1");
    assert_eq!(engine.booking_count(), 1);
}

#[tokio::test]
async fn edit_error_leaves_booking_untouched() {
    let engine = engine("update_edit_error.wal");
    let b = engine.insert_booking(draft(1, 9 * H, 10 * H, None)).await.unwrap();
    let result = engine
        .update_booking(b.id, |_| Err(EngineError::validation("nope")))
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
    assert_eq!(engine.get_booking(b.id).await, Some(b));
}

#[tokio::test]
async fn writes_after_torn_tail_survive_next_restart() {
    let path = test_wal_path("torn_restart.wal");
    let a = {
        let engine = Engine::new("1", path.clone()).unwrap();
        engine.insert_booking(draft(1, 9 * H, 10 * H, None)).await.unwrap()
    };
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
    }

    let b = {
        let engine = Engine::new("1", path.clone()).unwrap();
        assert_eq!(engine.booking_count(), 1);
        engine.insert_booking(draft(1, 11 * H, 12 * H, None)).await.unwrap()
    };

    let engine = Engine::new("1", path).unwrap();
    assert_eq!(engine.booking_count(), 2);
    assert_eq!(engine.get_booking(a.id).await, Some(a));
    assert_eq!(engine.get_booking(b.id).await, Some(b));
}

#[tokio::test]
async fn delete_frees_the_slot() {
    let engine = engine("delete_frees.wal");
    let b = engine
        .insert_booking(draft(1, 9 * H, 10 * H, Some("Alina")))
        .await
        .unwrap();
    let removed = engine.delete_booking(b.id).await.unwrap();
    assert_eq!(removed, b);
    assert!(!engine.contains_booking(&b.id));

    engine
        .insert_booking(draft(1, 9 * H, 10 * H, Some("Alina")))
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_unknown_not_found() {
    let engine = engine("delete_unknown.wal");
    assert!(matches!(
        engine.delete_booking(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn imported_legacy_booking_holds_thirty_minutes() {
    let engine = engine("import_legacy.wal");
    let old = legacy("1", 1, 9 * H, Some("Alina"));
    assert_eq!(engine.import_bookings(vec![old.clone()]).await.unwrap(), 1);

    let inside = engine
        .check_availability(date(1), Some(9 * H + 15), Some(9 * H + 45), Some("Alina"), None)
        .await;
    assert!(!inside.available);
    assert_eq!(inside.conflict.unwrap().end_time, "09:30");

    let after = engine
        .check_availability(date(1), Some(9 * H + 30), Some(10 * H + 30), Some("Alina"), None)
        .await;
    assert!(after.available);

    // New writes get an explicit end even right after a legacy row.
    let b = engine
        .insert_booking(draft(1, 9 * H + 30, 10 * H + 30, Some("Alina")))
        .await
        .unwrap();
    assert_eq!(b.end_time, Some(10 * H + 30));
}

#[tokio::test]
async fn import_rejects_foreign_tenant_and_duplicates() {
    let engine = engine("import_rejects.wal");
    assert!(matches!(
        engine.import_bookings(vec![legacy("2", 1, 9 * H, None)]).await,
        Err(EngineError::Validation(_))
    ));

    let b = legacy("1", 1, 9 * H, None);
    assert!(matches!(
        engine.import_bookings(vec![b.clone(), b.clone()]).await,
        Err(EngineError::Validation(_))
    ));
    engine.import_bookings(vec![b.clone()]).await.unwrap();
    assert!(matches!(
        engine.import_bookings(vec![b]).await,
        Err(EngineError::Validation(_))
    ));
    assert_eq!(engine.booking_count(), 1);
}

#[tokio::test]
async fn import_batch_size_limit() {
    let engine = engine("import_limit.wal");
    let batch: Vec<_> = (0..=MAX_IMPORT_BATCH).map(|_| legacy("1", 1, 9 * H, None)).collect();
    assert!(matches!(
        engine.import_bookings(batch).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn import_respects_bookings_per_day_limit() {
    let engine = engine("import_day_limit.wal");
    engine.insert_booking(draft(2, 9 * H, 10 * H, None)).await.unwrap();

    let mut batch = vec![legacy("1", 1, 9 * H, None)];
    batch.extend((0..MAX_BOOKINGS_PER_DAY).map(|_| legacy("1", 2, 12 * H, None)));
    assert!(matches!(
        engine.import_bookings(batch).await,
        Err(EngineError::LimitExceeded(_))
    ));
    // Nothing from the rejected batch landed, not even the other date.
    assert_eq!(engine.booking_count(), 1);
    assert!(engine.list_bookings(Some(date(1))).await.is_empty());
}

#[tokio::test]
async fn import_spanning_dates_replays() {
    let path = test_wal_path("import_replay.wal");
    let batch = vec![
        legacy("1", 3, 9 * H, None),
        legacy("1", 1, 9 * H, Some("Alina")),
        legacy("1", 3, 14 * H, Some("Diana")),
    ];
    {
        let engine = Engine::new("1", path.clone()).unwrap();
        assert_eq!(engine.import_bookings(batch.clone()).await.unwrap(), 3);
    }

    let engine = Engine::new("1", path).unwrap();
    assert_eq!(engine.booking_count(), 3);
    for b in &batch {
        assert_eq!(engine.get_booking(b.id).await.as_ref(), Some(b));
    }
    assert_eq!(engine.list_bookings(Some(date(3))).await.len(), 2);
}

#[tokio::test]
async fn availability_on_unknown_day_is_free() {
    let engine = engine("avail_empty.wal");
    let result = engine
        .check_availability(date(9), Some(9 * H), Some(10 * H), None, None)
        .await;
    assert_eq!(result, Availability::free());
}

#[tokio::test]
async fn listings_are_sorted_and_filtered() {
    let engine = engine("listings.wal");
    let late = engine.insert_booking(draft(2, 15 * H, 16 * H, Some("Alina"))).await.unwrap();
    let mut other_phone = draft(1, 12 * H, 13 * H, Some("Diana"));
    other_phone.client_phone = "8 (900) 111-22-33".into();
    let diana = engine.insert_booking(other_phone).await.unwrap();
    let early = engine.insert_booking(draft(1, 9 * H, 10 * H, Some("Alina"))).await.unwrap();

    let all: Vec<Ulid> = engine.list_bookings(None).await.iter().map(|b| b.id).collect();
    assert_eq!(all, vec![early.id, diana.id, late.id]);

    let day_one: Vec<Ulid> = engine.list_bookings(Some(date(1))).await.iter().map(|b| b.id).collect();
    assert_eq!(day_one, vec![early.id, diana.id]);

    let alina: Vec<Ulid> = engine.list_by_master("Alina").await.iter().map(|b| b.id).collect();
    assert_eq!(alina, vec![early.id, late.id]);

    let by_phone = engine.list_by_phone_suffix("9001112233").await;
    assert_eq!(by_phone.len(), 1);
    assert_eq!(by_phone[0].id, diana.id);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let survivors = {
        let engine = Engine::new("1", path.clone()).unwrap();
        let mut survivors = Vec::new();
        for i in 0..6 {
            let b = engine
                .insert_booking(draft(1, 8 * H + i * H, 9 * H + i * H, None))
                .await
                .unwrap();
            if i % 2 == 0 {
                engine.delete_booking(b.id).await.unwrap();
            } else {
                survivors.push(b);
            }
        }
        survivors.push(engine.insert_booking(draft(7, 9 * H, 10 * H, None)).await.unwrap());
        let emptied = engine.insert_booking(draft(8, 9 * H, 10 * H, None)).await.unwrap();
        engine.delete_booking(emptied.id).await.unwrap();

        assert_eq!(engine.wal_appends_since_compact().await, 12);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(engine.existing_day(&date(8)).is_none());
        survivors
    };

    assert_eq!(Wal::replay(&path).unwrap().len(), survivors.len());
    let engine = Engine::new("1", path).unwrap();
    for b in &survivors {
        assert_eq!(engine.get_booking(b.id).await.as_ref(), Some(b));
    }
    assert_eq!(engine.booking_count(), survivors.len());
}
