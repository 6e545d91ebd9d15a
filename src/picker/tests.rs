use super::*;
use proptest::prelude::*;

const A: PeerKey = PeerKey(1);
const B: PeerKey = PeerKey(2);
const C: PeerKey = PeerKey(3);

fn picker(num_pieces: u32, blocks_per_piece: u32) -> PiecePicker {
    let layout = PieceLayout::with_blocks(num_pieces, blocks_per_piece).unwrap();
    PiecePicker::with_seed(layout, 7)
}

/// Gives `piece` `count` more peers, none of which is A, B or C.
fn add_availability(picker: &mut PiecePicker, piece: u32, count: u32) {
    for i in 0..count {
        picker.inc_refcount(piece, PeerKey(100 + i));
    }
}

fn pick(
    picker: &mut PiecePicker,
    pieces: &Bitfield,
    num_blocks: usize,
    peer: PeerKey,
    options: PickOptions,
) -> Vec<PieceBlock> {
    let request = PickRequest::new(pieces, num_blocks, peer).with_options(options);
    picker.pick_pieces(&request)
}

fn request(picker: &mut PiecePicker, piece: u32, block: u32, peer: PeerKey) {
    assert!(picker.mark_as_downloading(
        PieceBlock::new(piece, block),
        peer,
        PickOptions::rarest_first()
    ));
}

fn download_piece(picker: &mut PiecePicker, piece: u32, peer: PeerKey) {
    for b in 0..picker.blocks_in_piece(piece) {
        let block = PieceBlock::new(piece, b);
        picker.mark_as_downloading(block, peer, PickOptions::rarest_first());
        picker.mark_as_writing(block, peer);
        picker.mark_as_finished(block, Some(peer));
    }
}

fn pieces_of(blocks: &[PieceBlock]) -> Vec<u32> {
    let mut pieces: Vec<u32> = blocks.iter().map(|b| b.piece_index).collect();
    pieces.sort_unstable();
    pieces.dedup();
    pieces
}

#[test]
fn test_simple_pick() {
    let mut p = picker(4, 1);
    let has = Bitfield::from_pieces(4, [0, 1, 2]);
    p.inc_refcount_bitfield(&has, A).unwrap();
    p.inc_refcount(3, B);

    let picked = pick(&mut p, &has, 2, A, PickOptions::rarest_first());
    assert_eq!(picked.len(), 2);
    assert_ne!(picked[0], picked[1]);
    for block in &picked {
        assert!(block.piece_index < 3);
        assert_eq!(block.block_index, 0);
    }
    p.check_invariant();
}

#[test]
fn test_priority_exclusion() {
    let mut p = picker(4, 1);
    let has = Bitfield::from_pieces(4, [0, 1, 2]);
    p.inc_refcount_bitfield(&has, A).unwrap();
    p.inc_refcount(3, B);
    assert!(p.set_piece_priority(1, 0));

    let picked = pick(&mut p, &has, 3, A, PickOptions::rarest_first());
    assert_eq!(pieces_of(&picked), vec![0, 2]);
    assert_eq!(picked.len(), 2);
    p.check_invariant();
}

#[test]
fn test_rarest_piece_first() {
    let mut p = picker(3, 1);
    add_availability(&mut p, 0, 3);
    add_availability(&mut p, 1, 1);
    add_availability(&mut p, 2, 2);
    let has = Bitfield::full(3);

    let picked = pick(&mut p, &has, 3, A, PickOptions::rarest_first());
    assert_eq!(
        picked,
        vec![
            PieceBlock::new(1, 0),
            PieceBlock::new(2, 0),
            PieceBlock::new(0, 0)
        ]
    );
}

#[test]
fn test_reverse_picks_common_first() {
    let mut p = picker(3, 1);
    add_availability(&mut p, 0, 1);
    add_availability(&mut p, 1, 2);
    add_availability(&mut p, 2, 3);
    let has = Bitfield::full(3);

    let options = PickOptions {
        reverse: true,
        ..PickOptions::rarest_first()
    };
    let picked = pick(&mut p, &has, 1, A, options);
    assert_eq!(picked, vec![PieceBlock::new(2, 0)]);
}

#[test]
fn test_partial_piece_before_open_piece() {
    let mut p = picker(2, 2);
    add_availability(&mut p, 0, 1);
    add_availability(&mut p, 1, 1);
    request(&mut p, 1, 0, A);

    let has = Bitfield::full(2);
    let picked = pick(&mut p, &has, 1, B, PickOptions::rarest_first());
    assert_eq!(picked, vec![PieceBlock::new(1, 1)]);
}

#[test]
fn test_prioritize_partials_when_many_in_flight() {
    let mut p = picker(4, 2);
    for piece in 0..3 {
        add_availability(&mut p, piece, 3);
    }
    add_availability(&mut p, 3, 1);
    request(&mut p, 0, 0, A);
    request(&mut p, 1, 0, A);
    let has = Bitfield::full(4);

    // two pieces in flight for one peer: finish them first
    let picked = pick(&mut p, &has, 1, B, PickOptions::rarest_first());
    assert_eq!(picked.len(), 1);
    assert!(picked[0].piece_index < 2);
    assert_eq!(picked[0].block_index, 1);

    // plenty of peers: rarest first wins
    let request = PickRequest::new(&has, 1, B).with_num_peers(10);
    assert_eq!(p.pick_pieces(&request), vec![PieceBlock::new(3, 0)]);
}

#[test]
fn test_end_game_busy_blocks() {
    let mut p = picker(2, 2);
    add_availability(&mut p, 0, 2);
    add_availability(&mut p, 1, 1);
    request(&mut p, 0, 0, A);
    request(&mut p, 0, 1, A);
    request(&mut p, 0, 0, C);
    assert_eq!(p.piece_state(0), PieceState::Full);

    let has = Bitfield::from_pieces(2, [0]);
    let picked = pick(&mut p, &has, 1, B, PickOptions::rarest_first());
    // fewest requesters first
    assert_eq!(picked, vec![PieceBlock::new(0, 1)]);
    assert!(p.is_requested(picked[0]));

    let picked = pick(&mut p, &has, 4, B, PickOptions::rarest_first());
    assert_eq!(picked.len(), 2);

    // a peer on parole never gets busy blocks
    let parole = PickOptions {
        on_parole: true,
        ..PickOptions::rarest_first()
    };
    assert!(pick(&mut p, &has, 4, B, parole).is_empty());
    p.check_invariant();
}

#[test]
fn test_hash_failure_round_trip() {
    let mut p = picker(4, 2);
    let has = Bitfield::full(4);
    p.inc_refcount_bitfield(&has, A).unwrap();

    download_piece(&mut p, 2, A);
    assert_eq!(p.piece_state(2), PieceState::Finished);
    assert!(p.is_piece_finished(2));

    p.mark_hashing(2);
    p.piece_failed(2);
    p.lock_piece(2);
    assert!(p.is_locked(2));
    p.restore_piece(2);

    assert_eq!(p.piece_state(2), PieceState::Open);
    assert_eq!(p.num_downloading(), 0);
    for b in 0..2 {
        assert_eq!(p.block_state(PieceBlock::new(2, b)), BlockState::None);
    }
    let picked = pick(&mut p, &has, 8, B, PickOptions::rarest_first());
    assert!(picked.contains(&PieceBlock::new(2, 0)));
    assert!(picked.contains(&PieceBlock::new(2, 1)));
    p.check_invariant();
}

#[test]
fn test_restore_is_idempotent() {
    let mut p = picker(2, 4);
    p.mark_as_pad(PieceBlock::new(0, 3));
    request(&mut p, 0, 0, A);
    p.mark_as_writing(PieceBlock::new(0, 0), A);
    p.mark_as_writing(PieceBlock::new(0, 1), B);
    p.mark_as_finished(PieceBlock::new(0, 1), Some(B));

    p.restore_piece(0);
    p.check_invariant();
    let info = p.piece_info(0);
    let states: Vec<BlockState> = (0..4)
        .map(|b| p.block_state(PieceBlock::new(0, b)))
        .collect();
    assert_eq!(info.finished, 1);
    assert_eq!(info.pad_blocks, 1);
    assert_eq!(states[3], BlockState::Finished);

    p.restore_piece(0);
    p.check_invariant();
    assert_eq!(p.piece_info(0), info);
    assert_eq!(p.downloading_pieces(), vec![info]);
    let again: Vec<BlockState> = (0..4)
        .map(|b| p.block_state(PieceBlock::new(0, b)))
        .collect();
    assert_eq!(again, states);
}

#[test]
fn test_we_have_removes_piece() {
    let mut p = picker(3, 2);
    let has = Bitfield::full(3);
    p.inc_refcount_bitfield(&has, A).unwrap();
    request(&mut p, 1, 0, A);
    assert_eq!(p.num_downloading(), 1);

    p.we_have(1);
    assert!(p.have_piece(1));
    assert_eq!(p.num_downloading(), 0);
    assert_eq!(p.num_have(), 1);
    assert!(p.is_finished_block(PieceBlock::new(1, 0)));

    let picked = pick(&mut p, &has, 10, B, PickOptions::rarest_first());
    assert_eq!(picked.len(), 4);
    assert!(picked.iter().all(|b| b.piece_index != 1));
    p.check_invariant();
}

#[test]
fn test_cursors() {
    let mut p = picker(5, 1);
    assert_eq!((p.cursor(), p.reverse_cursor()), (0, 5));

    p.we_have(0);
    assert_eq!(p.cursor(), 1);
    p.we_have(4);
    assert_eq!(p.reverse_cursor(), 4);
    p.set_piece_priority(1, 0);
    assert_eq!(p.cursor(), 2);
    p.we_have(2);
    assert_eq!((p.cursor(), p.reverse_cursor()), (3, 4));
    p.we_have(3);
    assert_eq!((p.cursor(), p.reverse_cursor()), (5, 0));
    assert!(p.is_finished());
    assert!(!p.is_seeding());
    p.check_invariant();

    p.we_dont_have(3);
    assert_eq!((p.cursor(), p.reverse_cursor()), (3, 4));
    assert_eq!(p.num_want_left(), 1);
    p.check_invariant();
}

#[test]
fn test_sequential() {
    let mut p = picker(6, 1);
    let has = Bitfield::full(6);

    let picked = pick(&mut p, &has, 3, A, PickOptions::sequential());
    assert_eq!(pieces_of(&picked), vec![0, 1, 2]);
    assert_eq!(picked[0], PieceBlock::new(0, 0));

    let backwards = PickOptions {
        reverse: true,
        ..PickOptions::sequential()
    };
    let picked = pick(&mut p, &has, 3, A, backwards);
    assert_eq!(
        picked,
        vec![
            PieceBlock::new(5, 0),
            PieceBlock::new(4, 0),
            PieceBlock::new(3, 0)
        ]
    );

    p.we_have(0);
    let picked = pick(&mut p, &has, 1, A, PickOptions::sequential());
    assert_eq!(picked, vec![PieceBlock::new(1, 0)]);
}

#[test]
fn test_random_mode_respects_peer_pieces() {
    let mut p = picker(8, 1);
    let has = Bitfield::from_pieces(8, [1, 3]);
    p.inc_refcount_bitfield(&has, A).unwrap();

    let picked = pick(&mut p, &has, 4, A, PickOptions::default());
    assert_eq!(pieces_of(&picked), vec![1, 3]);
}

#[test]
fn test_time_critical_only_top_priority() {
    let mut p = picker(4, 1);
    let has = Bitfield::full(4);
    p.inc_refcount_bitfield(&has, A).unwrap();
    assert!(!p.set_piece_priority(3, TOP_PRIORITY));

    let options = PickOptions {
        time_critical: true,
        ..PickOptions::rarest_first()
    };
    let picked = pick(&mut p, &has, 4, A, options);
    assert_eq!(picked, vec![PieceBlock::new(3, 0)]);
}

#[test]
fn test_suggested_piece_first() {
    let mut p = picker(4, 1);
    add_availability(&mut p, 0, 1);
    add_availability(&mut p, 2, 5);
    let has = Bitfield::from_pieces(4, [0, 2]);

    let suggested = [2];
    let request = PickRequest::new(&has, 1, A).with_suggested(&suggested);
    assert_eq!(p.pick_pieces(&request), vec![PieceBlock::new(2, 0)]);

    // filtered pieces are never picked, suggested or not
    p.set_piece_priority(2, 0);
    let request = PickRequest::new(&has, 1, A).with_suggested(&suggested);
    assert_eq!(p.pick_pieces(&request), vec![PieceBlock::new(0, 0)]);
}

#[test]
fn test_parole_only_exclusive_pieces() {
    let mut p = picker(3, 2);
    let has = Bitfield::full(3);
    p.inc_refcount_bitfield(&has, C).unwrap();
    request(&mut p, 0, 0, A);

    let parole = PickOptions {
        on_parole: true,
        ..PickOptions::rarest_first()
    };
    let picked = pick(&mut p, &has, 10, B, parole);
    assert_eq!(picked.len(), 4);
    assert_eq!(pieces_of(&picked), vec![1, 2]);

    let picked = pick(&mut p, &has, 10, A, parole);
    assert_eq!(picked.len(), 5);
    assert!(picked.contains(&PieceBlock::new(0, 1)));
}

#[test]
fn test_prefer_contiguous_aligned() {
    let mut p = picker(8, 2);
    let has = Bitfield::full(8);
    p.inc_refcount_bitfield(&has, C).unwrap();

    let options = PickOptions {
        align_expanded_pieces: true,
        ..PickOptions::rarest_first()
    };
    let request = PickRequest::new(&has, 1, A)
        .with_options(options)
        .with_contiguous(4);
    let picked = p.pick_pieces(&request);
    assert_eq!(picked.len(), 4);
    let pieces = pieces_of(&picked);
    assert_eq!(pieces.len(), 2);
    assert_eq!(pieces[0] % 2, 0);
    assert_eq!(pieces[1], pieces[0] + 1);
}

#[test]
fn test_piece_extent_affinity() {
    // 1 MiB pieces, four to an extent
    let mut p = picker(16, 64);
    for piece in 0..16 {
        add_availability(&mut p, piece, 2);
    }
    p.dec_refcount(5, PeerKey(101));
    let has = Bitfield::full(16);
    let affinity = PickOptions {
        piece_extent_affinity: true,
        ..PickOptions::rarest_first()
    };

    let picked = pick(&mut p, &has, 64, B, affinity);
    assert_eq!(pieces_of(&picked), vec![5]);
    for block in picked {
        assert!(p.mark_as_downloading(block, B, affinity));
    }
    assert_eq!(p.piece_state(5), PieceState::Full);

    p.dec_refcount(13, PeerKey(101));
    let picked = pick(&mut p, &has, 1, B, affinity);
    assert_eq!(picked, vec![PieceBlock::new(4, 0)]);

    let picked = pick(&mut p, &has, 1, B, PickOptions::rarest_first());
    assert_eq!(picked, vec![PieceBlock::new(13, 0)]);
    p.check_invariant();
}

#[test]
fn test_extent_affinity_skips_mixed_priority_extent() {
    // 1 MiB pieces, four to an extent
    let mut p = picker(8, 64);
    for (piece, count) in [3, 3, 1, 3, 3, 2, 3, 3].into_iter().enumerate() {
        add_availability(&mut p, piece as u32, count);
    }
    p.set_piece_priority(1, 3);
    let has = Bitfield::full(8);
    let affinity = PickOptions {
        piece_extent_affinity: true,
        ..PickOptions::rarest_first()
    };

    let picked = pick(&mut p, &has, 64, B, affinity);
    assert_eq!(pieces_of(&picked), vec![2]);
    for block in picked {
        assert!(p.mark_as_downloading(block, B, affinity));
    }

    // piece 1 wants a different priority, so the rest of the extent gets no
    // preference over the rarer piece 5
    let picked = pick(&mut p, &has, 1, B, affinity);
    assert_eq!(picked, vec![PieceBlock::new(5, 0)]);
    p.check_invariant();
}

#[test]
fn test_pad_blocks() {
    let mut p = picker(2, 4);
    let has = Bitfield::full(2);
    p.inc_refcount_bitfield(&has, A).unwrap();
    let pad = PieceBlock::new(0, 3);
    p.mark_as_pad(pad);

    let info = p.piece_info(0);
    assert_eq!((info.finished, info.pad_blocks), (1, 1));
    assert!(p.is_pad(pad));

    let picked = pick(&mut p, &has, 10, B, PickOptions::rarest_first());
    assert_eq!(picked.len(), 7);
    assert!(!picked.contains(&pad));

    for b in 0..3 {
        let block = PieceBlock::new(0, b);
        p.mark_as_writing(block, B);
        p.mark_as_finished(block, Some(B));
    }
    assert_eq!(p.unverified_blocks(), 3);
    assert!(p.piece_passed(0));
    assert!(p.have_piece(0));
    assert_eq!(p.num_pad_blocks(), 1);
    assert_eq!(p.pad_blocks_in_piece(0), 1);
    assert_eq!(p.unverified_blocks(), 0);
    p.check_invariant();

    // pads come back with the piece
    p.we_dont_have(0);
    assert_eq!(p.piece_info(0).pad_blocks, 1);
    assert_eq!(p.block_state(pad), BlockState::Finished);
    p.check_invariant();
}

#[test]
fn test_piece_passed_waits_for_writes() {
    let mut p = picker(1, 2);
    p.mark_as_writing(PieceBlock::new(0, 0), A);
    p.mark_as_writing(PieceBlock::new(0, 1), A);
    p.mark_hashing(0);

    assert!(!p.piece_passed(0));
    assert!(p.piece_info(0).passed_hash_check);
    p.mark_as_finished(PieceBlock::new(0, 0), None);
    assert!(!p.have_piece(0));
    p.mark_as_finished(PieceBlock::new(0, 1), None);
    assert!(p.have_piece(0));
    assert!(p.is_seeding());
    p.check_invariant();
}

#[test]
fn test_write_failed_locks_piece() {
    let mut p = picker(1, 2);
    let has = Bitfield::full(1);
    p.inc_refcount_bitfield(&has, A).unwrap();
    let first = PieceBlock::new(0, 0);
    p.mark_as_writing(PieceBlock::new(0, 1), A);
    p.mark_as_finished(PieceBlock::new(0, 1), Some(A));
    request(&mut p, 0, 0, A);
    p.mark_as_writing(first, A);

    p.write_failed(first);
    assert_eq!(p.block_state(first), BlockState::None);
    assert!(p.is_locked(0));
    assert!(pick(&mut p, &has, 2, B, PickOptions::rarest_first()).is_empty());
    assert!(!p.mark_as_downloading(first, B, PickOptions::rarest_first()));

    p.unlock_piece(0);
    assert_eq!(
        pick(&mut p, &has, 2, B, PickOptions::rarest_first()),
        vec![first]
    );
    p.check_invariant();
}

#[test]
fn test_abort_download() {
    let mut p = picker(2, 2);
    let block = PieceBlock::new(0, 0);
    request(&mut p, 0, 0, A);
    request(&mut p, 0, 0, B);
    assert_eq!(p.num_peers(block), 2);

    p.abort_download(block, A);
    assert!(p.is_requested(block));
    assert_eq!(p.num_peers(block), 1);

    p.abort_download(block, B);
    assert_eq!(p.block_state(block), BlockState::None);
    assert_eq!(p.piece_state(0), PieceState::Open);
    assert_eq!(p.num_downloading(), 0);
    p.check_invariant();
}

#[test]
fn test_writing_ends_other_claims() {
    let mut p = picker(1, 2);
    let block = PieceBlock::new(0, 0);
    request(&mut p, 0, 0, A);
    request(&mut p, 0, 0, B);

    assert!(p.mark_as_writing(block, A));
    assert_eq!(p.num_peers(block), 0);
    assert!(p.is_downloaded(block));
    assert!(!p.mark_as_writing(block, B));
    p.abort_download(block, B);
    assert_eq!(p.block_state(block), BlockState::Writing);
    assert_eq!(p.downloader(block), Some(A));
    p.check_invariant();
}

#[test]
fn test_clear_peer() {
    let mut p = picker(1, 3);
    request(&mut p, 0, 0, A);
    p.mark_as_writing(PieceBlock::new(0, 2), B);
    assert_eq!(p.downloaders(0), vec![Some(A), None, Some(B)]);

    p.clear_peer(A);
    assert_eq!(p.downloaders(0), vec![None, None, Some(B)]);
    assert!(p.is_requested(PieceBlock::new(0, 0)));
    assert_eq!(p.num_peers(PieceBlock::new(0, 0)), 1);
    p.check_invariant();
}

#[test]
fn test_seeds() {
    let mut p = picker(3, 1);
    let has = Bitfield::full(3);
    p.inc_refcount_all(A);
    assert_eq!(p.num_seeds(), 1);
    assert_eq!(p.availability(1), 1);
    assert_eq!(pick(&mut p, &has, 3, A, PickOptions::rarest_first()).len(), 3);

    p.dec_refcount_all(A);
    assert_eq!(p.availability_all(), vec![0, 0, 0]);
    assert!(pick(&mut p, &has, 3, A, PickOptions::rarest_first()).is_empty());

    // a have-all peer counted through its bitfield
    p.inc_refcount_bitfield(&has, B).unwrap();
    p.dec_refcount_all(B);
    assert_eq!(p.availability_all(), vec![0, 0, 0]);
    p.check_invariant();
}

#[test]
fn test_distributed_copies() {
    let mut p = picker(4, 1);
    add_availability(&mut p, 0, 1);
    add_availability(&mut p, 1, 2);
    add_availability(&mut p, 2, 2);
    add_availability(&mut p, 3, 1);
    assert!((p.distributed_copies() - 1.5).abs() < f32::EPSILON);

    p.inc_refcount_all(A);
    assert!((p.distributed_copies() - 2.5).abs() < f32::EPSILON);
}

#[test]
fn test_set_priority_reports_filter_transitions() {
    let mut p = picker(2, 1);
    assert!(p.set_piece_priority(0, 0));
    assert_eq!(p.num_filtered(), 1);
    assert!(!p.set_piece_priority(0, 0));
    assert!(p.set_piece_priority(0, 3));
    assert!(!p.set_piece_priority(0, 5));
    assert_eq!(p.num_filtered(), 0);

    p.we_have(1);
    assert!(p.set_piece_priority(1, 0));
    assert_eq!(p.num_have_filtered(), 1);
    assert_eq!(p.num_want_left(), 1);
    p.check_invariant();
}

#[test]
fn test_zero_priority_partial_piece() {
    let mut p = picker(2, 2);
    request(&mut p, 0, 0, A);
    p.set_piece_priority(0, 0);
    assert_eq!(p.piece_state(0), PieceState::ZeroPriority);
    p.set_piece_priority(0, 4);
    assert_eq!(p.piece_state(0), PieceState::Downloading);
    p.check_invariant();
}

#[test]
fn test_bitfield_length_mismatch() {
    let mut p = picker(4, 1);
    let wrong = Bitfield::full(5);
    assert_eq!(
        p.inc_refcount_bitfield(&wrong, A),
        Err(PickerError::BitfieldLength {
            expected: 4,
            actual: 5
        })
    );
    assert!(pick(&mut p, &wrong, 4, A, PickOptions::rarest_first()).is_empty());
}

#[test]
fn test_pick_options_bits() {
    let options = PickOptions {
        reverse: true,
        on_parole: true,
        ..PickOptions::sequential()
    };
    assert_eq!(options.to_bits(), 0x16);
    assert_eq!(PickOptions::from_bits(0x16), options);
    assert!(options.is_valid());
    assert!(!PickOptions::from_bits(PickOptions::RAREST_FIRST | PickOptions::SEQUENTIAL).is_valid());
}

const PIECES: u32 = 6;
const BLOCKS: u32 = 3;
const PEERS: u32 = 4;

#[derive(Debug, Clone)]
enum Op {
    Request(u32, u32, u32),
    Write(u32, u32, u32),
    Finish(u32, u32),
    Abort(u32, u32, u32),
    Restore(u32),
    Priority(u32, u8),
    Passed(u32),
    Pick(u32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..PIECES, 0..BLOCKS, 0..PEERS).prop_map(|(p, b, k)| Op::Request(p, b, k)),
        (0..PIECES, 0..BLOCKS, 0..PEERS).prop_map(|(p, b, k)| Op::Write(p, b, k)),
        (0..PIECES, 0..BLOCKS).prop_map(|(p, b)| Op::Finish(p, b)),
        (0..PIECES, 0..BLOCKS, 0..PEERS).prop_map(|(p, b, k)| Op::Abort(p, b, k)),
        (0..PIECES).prop_map(Op::Restore),
        (0..PIECES, 0u8..=7).prop_map(|(p, prio)| Op::Priority(p, prio)),
        (0..PIECES).prop_map(Op::Passed),
        (0..PEERS).prop_map(Op::Pick),
    ]
}

proptest! {
    #[test]
    fn prop_block_counts_are_conserved(ops in proptest::collection::vec(op(), 1..200)) {
        let mut p = picker(PIECES, BLOCKS);
        let has = Bitfield::full(PIECES as usize);
        p.inc_refcount_bitfield(&has, PeerKey(99)).unwrap();
        let options = PickOptions::rarest_first();

        for op in ops {
            match op {
                Op::Request(piece, b, k) => {
                    p.mark_as_downloading(PieceBlock::new(piece, b), PeerKey(k), options);
                }
                Op::Write(piece, b, k) => {
                    p.mark_as_writing(PieceBlock::new(piece, b), PeerKey(k));
                }
                Op::Finish(piece, b) => p.mark_as_finished(PieceBlock::new(piece, b), None),
                Op::Abort(piece, b, k) => p.abort_download(PieceBlock::new(piece, b), PeerKey(k)),
                Op::Restore(piece) => {
                    if p.piece_info(piece).requested == 0 {
                        p.restore_piece(piece);
                    }
                }
                Op::Priority(piece, prio) => {
                    p.set_piece_priority(piece, prio);
                }
                Op::Passed(piece) => {
                    if p.is_piece_finished(piece) && !p.have_piece(piece) {
                        prop_assert!(p.piece_passed(piece));
                    }
                }
                Op::Pick(k) => {
                    let peer = PeerKey(k);
                    for block in pick(&mut p, &has, 4, peer, options) {
                        if !p.is_requested(block) {
                            prop_assert!(p.mark_as_downloading(block, peer, options));
                        }
                    }
                }
            }

            p.check_invariant();
            for piece in 0..PIECES {
                let info = p.piece_info(piece);
                prop_assert!(info.finished + info.writing + info.requested <= BLOCKS);
            }
        }
    }
}
