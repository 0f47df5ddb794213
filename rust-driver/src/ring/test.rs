use super::*;

fn new_test_queue(max: u32) -> WorkQueue {
    let geo = RingGeometry {
        max,
        wqe_shift: 6,
        max_gs: 3,
        offset: 0,
    };
    let buf = Arc::new(DmaBuf::alloc(geo.bytes()).unwrap());
    WorkQueue::new(geo, DoorbellMode::Legacy, buf)
}

#[test]
fn fills_to_capacity_then_reports_full() {
    let wq = new_test_queue(16);
    let mut ctx = wq.lock();
    for i in 0..16 {
        assert!(!wq.is_full(&ctx));
        let ind = ctx.next_ind;
        assert_eq!(ind, i);
        ctx.advance(ind, 16);
    }
    assert!(wq.is_full(&ctx));
    assert_eq!(ctx.next_ind, 0);
    assert_eq!(ctx.last, 15);

    wq.retire(0);
    assert!(!wq.is_full(&ctx));
    assert_eq!(wq.outstanding(&ctx), 15);
}

#[test]
fn retire_skips_unsignaled_requests() {
    let wq = new_test_queue(8);
    let mut ctx = wq.lock();
    for _ in 0..5 {
        let ind = ctx.next_ind;
        ctx.advance(ind, 8);
    }
    // only the fifth request was signaled
    wq.retire(4);
    assert_eq!(wq.outstanding(&ctx), 0);
}

#[test]
fn retire_wraps_around() {
    let wq = new_test_queue(4);
    let mut ctx = wq.lock();
    for round in 0..3 {
        for i in 0..4 {
            let ind = ctx.next_ind;
            ctx.advance(ind, 4);
            wq.retire(i);
            assert_eq!(wq.outstanding(&ctx), 0, "round {round} slot {i}");
        }
    }
    assert_eq!(ctx.head, 12);
}

#[test]
fn reset_empties_queue() {
    let wq = new_test_queue(4);
    let mut ctx = wq.lock();
    for _ in 0..3 {
        let ind = ctx.next_ind;
        ctx.advance(ind, 4);
    }
    wq.retire(1);
    wq.reset(&mut ctx);
    assert_eq!(*ctx, RingCtx::new(4));
    assert_eq!(wq.outstanding(&ctx), 0);
    wq.reset(&mut ctx);
    assert_eq!(ctx.head, 0);
    assert_eq!(ctx.last, 3);
}

#[test]
fn wrids_and_addresses_follow_slots() {
    let geo = RingGeometry {
        max: 4,
        wqe_shift: 7,
        max_gs: 6,
        offset: 256,
    };
    let buf = Arc::new(DmaBuf::alloc(1024).unwrap());
    let wq = WorkQueue::new(geo, DoorbellMode::Legacy, buf);
    assert_eq!(wq.wqe_addr(0), 256);
    assert_eq!(wq.wqe_addr(3), 256 + 3 * 128);
    wq.set_wrid(2, 0xabcd);
    assert_eq!(wq.wrid(2), 0xabcd);
    assert_eq!(wq.slot(1).base(), 384);
}

#[test]
#[should_panic(expected = "beyond")]
fn slot_index_is_bounded() {
    let wq = new_test_queue(4);
    let _ = wq.slot(4);
}
