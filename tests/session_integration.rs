//! Multi-participant integration tests over the in-process transport.
//!
//! Each test wires two or three sessions to one shared transport and one
//! shared comment store, the way the platform wires real clients, and
//! checks that their views converge.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use scribe_collab::{
    Anchor, ChatKind, CursorPosition, DocumentSession, InMemoryCommentStore,
    InProcessTransport, Notification, Profile, Rect, StaticDirectory, SurfaceMetrics,
};

struct Rig {
    transport: Arc<InProcessTransport>,
    directory: Arc<StaticDirectory>,
    store: Arc<InMemoryCommentStore>,
}

impl Rig {
    fn new(names: &[(Uuid, &str)]) -> Self {
        let mut directory = StaticDirectory::new();
        for (id, name) in names {
            directory.insert(*id, Profile::named(*name));
        }
        Self {
            transport: Arc::new(InProcessTransport::new()),
            directory: Arc::new(directory),
            store: Arc::new(InMemoryCommentStore::new()),
        }
    }

    fn session(&self, id: Uuid) -> (DocumentSession, mpsc::UnboundedReceiver<Notification>) {
        let mut session = DocumentSession::new(
            self.transport.clone(),
            self.directory.clone(),
            self.store.clone(),
            id,
        );
        let notes = session
            .take_notification_rx()
            .expect("fresh session has a notification receiver");
        (session, notes)
    }
}

/// Let forwarder tasks drain the broadcast channels.
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(note) = rx.try_recv() {
        out.push(note);
    }
    out
}

fn anchor(start: usize, end: usize) -> Anchor {
    Anchor {
        range_start: start,
        range_end: end,
        quoted_text: "quoted".into(),
    }
}

#[tokio::test]
async fn test_two_participants_see_each_other() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let rig = Rig::new(&[(alice, "Alice"), (bob, "Bob")]);
    let doc = Uuid::new_v4();

    let (mut session_a, mut notes_a) = rig.session(alice);
    let (mut session_b, mut notes_b) = rig.session(bob);

    session_a.open(doc).unwrap();
    settle().await;
    session_a.pump_ready();
    // Alone on the document: no join notifications.
    assert!(drain(&mut notes_a).is_empty());

    session_b.open(doc).unwrap();
    settle().await;
    session_a.pump_ready();
    session_b.pump_ready();

    let a_notes = drain(&mut notes_a);
    assert_eq!(
        a_notes,
        vec![Notification::Joined {
            participant_id: bob,
            display_name: "Bob".into(),
        }],
        "join delta and snapshot must notify exactly once"
    );
    // Bob's first snapshot already contains Alice.
    assert_eq!(
        drain(&mut notes_b),
        vec![Notification::Joined {
            participant_id: alice,
            display_name: "Alice".into(),
        }]
    );
    assert_eq!(session_a.presence().unwrap().remote_count(), 1);
    assert_eq!(session_b.presence().unwrap().remote_count(), 1);

    // The join also lands in the local system chat log.
    let chat = session_a.chat().unwrap();
    assert_eq!(chat.len(), 1);
    assert_eq!(chat.messages()[0].kind, ChatKind::System);
    assert!(chat.messages()[0].body.contains("Bob joined"));
}

#[tokio::test]
async fn test_editing_flip_notifies_peers_once() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let rig = Rig::new(&[(alice, "Alice"), (bob, "Bob")]);
    let doc = Uuid::new_v4();

    let (mut session_a, mut notes_a) = rig.session(alice);
    let (mut session_b, _notes_b) = rig.session(bob);
    session_a.open(doc).unwrap();
    session_b.open(doc).unwrap();
    settle().await;
    session_a.pump_ready();
    drain(&mut notes_a);

    session_b.set_editing(true);
    // Suppressed: no change, no announcement storm.
    session_b.set_editing(true);
    settle().await;
    session_a.pump_ready();

    let editing: Vec<Notification> = drain(&mut notes_a)
        .into_iter()
        .filter(|n| matches!(n, Notification::NowEditing { .. }))
        .collect();
    assert_eq!(
        editing,
        vec![Notification::NowEditing {
            participant_id: bob,
            display_name: "Bob".into(),
        }]
    );
}

#[tokio::test]
async fn test_cursor_moves_project_onto_peer_viewports() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let rig = Rig::new(&[(alice, "Alice"), (bob, "Bob")]);
    let doc = Uuid::new_v4();

    let (mut session_a, _notes_a) = rig.session(alice);
    let (mut session_b, _notes_b) = rig.session(bob);
    session_a.open(doc).unwrap();
    session_b.open(doc).unwrap();
    settle().await;
    session_a.pump_ready();

    session_b.update_cursor(CursorPosition {
        anchor_start: 42,
        anchor_end: 42,
        screen: Some((300.0, 180.0)),
    });
    settle().await;
    session_a.pump_ready();

    let viewport = Rect::new(0.0, 0.0, 800.0, 600.0);
    let sprites = session_a.cursors(viewport, &SurfaceMetrics::default());
    assert_eq!(sprites.len(), 1);
    assert_eq!(sprites[0].participant_id, bob);
    assert_eq!(sprites[0].label, "Bob");
    assert_eq!((sprites[0].x, sprites[0].y), (300.0, 180.0));

    // Bob leaves: the cursor disappears with the presence record.
    session_b.close();
    settle().await;
    session_a.pump_ready();
    assert!(session_a.cursors(viewport, &SurfaceMetrics::default()).is_empty());
    assert_eq!(session_a.presence().unwrap().remote_count(), 0);
}

#[tokio::test]
async fn test_leave_notifies_and_logs_system_chat() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let rig = Rig::new(&[(alice, "Alice"), (bob, "Bob")]);
    let doc = Uuid::new_v4();

    let (mut session_a, mut notes_a) = rig.session(alice);
    let (mut session_b, _notes_b) = rig.session(bob);
    session_a.open(doc).unwrap();
    session_b.open(doc).unwrap();
    settle().await;
    session_a.pump_ready();
    drain(&mut notes_a);

    session_b.close();
    settle().await;
    session_a.pump_ready();

    assert_eq!(
        drain(&mut notes_a),
        vec![Notification::Left {
            participant_id: bob,
            display_name: "Bob".into(),
        }]
    );
    let bodies: Vec<&str> = session_a
        .chat()
        .unwrap()
        .messages()
        .iter()
        .map(|m| m.body.as_str())
        .collect();
    assert!(bodies.iter().any(|b| b.contains("Bob left")));
}

#[tokio::test]
async fn test_chat_broadcast_appears_exactly_once_everywhere() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let rig = Rig::new(&[(alice, "Alice"), (bob, "Bob")]);
    let doc = Uuid::new_v4();

    let (mut session_a, _notes_a) = rig.session(alice);
    let (mut session_b, _notes_b) = rig.session(bob);
    session_a.open(doc).unwrap();
    session_b.open(doc).unwrap();
    settle().await;
    session_a.pump_ready();
    session_b.pump_ready();
    session_a.clear_chat();
    session_b.clear_chat();

    let id = session_a.send_chat("shall we merge this?").unwrap();
    settle().await;
    session_a.pump_ready();
    session_b.pump_ready();

    // Sender: immediate local append, echo de-duplicated by id.
    let a_msgs = session_a.chat().unwrap().messages();
    assert_eq!(a_msgs.len(), 1);
    assert_eq!(a_msgs[0].id, id);

    // Receiver: one copy, carrying the sender's display metadata.
    let b_msgs = session_b.chat().unwrap().messages();
    assert_eq!(b_msgs.len(), 1);
    assert_eq!(b_msgs[0].id, id);
    assert_eq!(b_msgs[0].sender_id, alice);
    assert_eq!(b_msgs[0].display_name, "Alice");
    assert_eq!(b_msgs[0].body, "shall we merge this?");
}

#[tokio::test]
async fn test_comment_thread_converges_across_participants() {
    let alice = Uuid::new_v4();
    let carol = Uuid::new_v4();
    let rig = Rig::new(&[(alice, "Alice"), (carol, "Carol")]);
    let doc = Uuid::new_v4();

    let (mut session_a, mut notes_a) = rig.session(alice);
    let (mut session_c, mut notes_c) = rig.session(carol);
    session_a.open(doc).unwrap();
    session_c.open(doc).unwrap();
    settle().await;
    session_a.pump_ready();
    session_c.pump_ready();
    drain(&mut notes_a);
    drain(&mut notes_c);

    // Alice anchors a comment; it reaches both through the change feed.
    let id = session_a
        .create_comment(anchor(12, 30), "needs review")
        .unwrap();
    settle().await;
    session_a.pump_ready();
    session_c.pump_ready();

    for session in [&session_a, &session_c] {
        let comment = session.comments().unwrap().get(id).unwrap();
        assert_eq!(comment.body, "needs review");
        assert_eq!(comment.anchor, anchor(12, 30));
        assert!(!comment.resolved);
        assert!(comment.replies.is_empty());
    }
    // Only the non-author is notified.
    assert!(drain(&mut notes_a).is_empty());
    assert_eq!(
        drain(&mut notes_c),
        vec![Notification::CommentAdded {
            comment_id: id,
            author_id: alice,
            author_name: "Alice".into(),
        }]
    );

    // Carol replies; the thread grows for Alice without touching the
    // anchor or the resolved flag.
    session_c.reply_to_comment(id, "agreed, see line 30").unwrap();
    settle().await;
    session_a.pump_ready();

    let thread = session_a.comments().unwrap().get(id).unwrap();
    assert_eq!(thread.replies.len(), 1);
    assert_eq!(thread.replies[0].author_id, carol);
    assert_eq!(thread.replies[0].body, "agreed, see line 30");
    assert_eq!(thread.anchor, anchor(12, 30));
    assert!(!thread.resolved);
}

#[tokio::test]
async fn test_resolve_propagates_and_stays_resolved() {
    let alice = Uuid::new_v4();
    let carol = Uuid::new_v4();
    let rig = Rig::new(&[(alice, "Alice"), (carol, "Carol")]);
    let doc = Uuid::new_v4();

    let (mut session_a, _notes_a) = rig.session(alice);
    let (mut session_c, _notes_c) = rig.session(carol);
    session_a.open(doc).unwrap();
    session_c.open(doc).unwrap();
    settle().await;

    let id = session_a.create_comment(anchor(0, 8), "typo here").unwrap();
    settle().await;
    session_a.pump_ready();
    session_c.pump_ready();

    session_c.resolve_comment(id).unwrap();
    settle().await;
    session_a.pump_ready();
    session_c.pump_ready();

    assert!(session_a.comments().unwrap().get(id).unwrap().resolved);
    assert!(session_c.comments().unwrap().get(id).unwrap().resolved);

    // Resolving again anywhere is an idempotent no-op.
    session_a.resolve_comment(id).unwrap();
    settle().await;
    session_c.pump_ready();
    assert!(session_c.comments().unwrap().get(id).unwrap().resolved);
}

#[tokio::test]
async fn test_late_joiner_seeds_existing_comments() {
    let alice = Uuid::new_v4();
    let dave = Uuid::new_v4();
    let rig = Rig::new(&[(alice, "Alice"), (dave, "Dave")]);
    let doc = Uuid::new_v4();

    let (mut session_a, _notes_a) = rig.session(alice);
    session_a.open(doc).unwrap();
    settle().await;
    let first = session_a.create_comment(anchor(5, 9), "early note").unwrap();
    settle().await;
    session_a.pump_ready();

    // Dave opens afterwards: the seed list already contains the comment,
    // no feed event needed.
    let (mut session_d, _notes_d) = rig.session(dave);
    session_d.open(doc).unwrap();
    assert!(session_d.comments().unwrap().get(first).is_some());
}

#[tokio::test]
async fn test_document_switch_isolates_state() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let rig = Rig::new(&[(alice, "Alice"), (bob, "Bob")]);
    let doc_one = Uuid::new_v4();
    let doc_two = Uuid::new_v4();

    let (mut session_a, mut notes_a) = rig.session(alice);
    let (mut session_b, mut notes_b) = rig.session(bob);
    session_a.open(doc_one).unwrap();
    session_b.open(doc_one).unwrap();
    settle().await;
    session_a.pump_ready();
    session_b.pump_ready();
    drain(&mut notes_a);
    drain(&mut notes_b);

    let _ = session_a.send_chat("on doc one");
    let doc_one_comment = session_a
        .create_comment(anchor(1, 4), "doc one only")
        .unwrap();
    settle().await;
    session_a.pump_ready();
    session_b.pump_ready();
    drain(&mut notes_b);

    session_a.switch_document(doc_two).unwrap();
    settle().await;
    session_a.pump_ready();
    session_b.pump_ready();

    // Alice's new session state is empty: no carried chat, comments, or
    // presence from the old document.
    assert_eq!(session_a.document_id(), Some(doc_two));
    assert!(session_a.chat().unwrap().is_empty());
    assert!(session_a.comments().unwrap().get(doc_one_comment).is_none());
    assert_eq!(session_a.presence().unwrap().remote_count(), 0);

    // Bob saw Alice leave and keeps his own view of doc one.
    assert_eq!(
        drain(&mut notes_b),
        vec![Notification::Left {
            participant_id: alice,
            display_name: "Alice".into(),
        }]
    );
    assert!(session_b.comments().unwrap().get(doc_one_comment).is_some());
}

#[tokio::test]
async fn test_unknown_profile_degrades_to_anonymous() {
    let alice = Uuid::new_v4();
    let stranger = Uuid::new_v4();
    // Only Alice is in the directory.
    let rig = Rig::new(&[(alice, "Alice")]);
    let doc = Uuid::new_v4();

    let (mut session_a, mut notes_a) = rig.session(alice);
    let (mut session_s, _notes_s) = rig.session(stranger);
    session_a.open(doc).unwrap();
    session_s.open(doc).unwrap();
    settle().await;
    session_a.pump_ready();

    assert_eq!(
        drain(&mut notes_a),
        vec![Notification::Joined {
            participant_id: stranger,
            display_name: "Anonymous".into(),
        }]
    );
}

#[tokio::test]
async fn test_degraded_session_recovers_on_reopen() {
    let alice = Uuid::new_v4();
    let rig = Rig::new(&[(alice, "Alice")]);
    let doc = Uuid::new_v4();

    rig.transport.set_offline(true);
    let (mut session, mut notes) = rig.session(alice);
    session.open(doc).unwrap();
    assert!(session.is_degraded());
    assert_eq!(drain(&mut notes), vec![Notification::Degraded]);

    // Comments still work against persistence while degraded.
    let id = session.create_comment(anchor(2, 6), "offline note").unwrap();
    settle().await;
    session.pump_ready();
    assert!(session.comments().unwrap().get(id).is_some());

    // Transport returns; reopening restores a live session with the
    // comment still present from the seed.
    rig.transport.set_offline(false);
    session.switch_document(doc).unwrap();
    assert!(!session.is_degraded());
    assert!(session.comments().unwrap().get(id).is_some());
}
