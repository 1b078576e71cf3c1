//! End-to-end checks of the changeset algebra and revision log working
//! together: concurrent clients, stale cursors and log replay.

use tandem_core::{
    compose, follow, ChangeSet, ClientDocument, DocumentState, EditEvent, Reconciled,
};
use uuid::Uuid;

fn seeded(text: &str) -> (DocumentState, Uuid) {
    let mut state = DocumentState::new();
    let author = Uuid::new_v4();
    state.add_client(author);
    state
        .update_state(author, ChangeSet::from_text(text), 0)
        .unwrap();
    (state, author)
}

#[test]
fn concurrent_clients_converge_in_either_order() {
    let insert = ChangeSet::splice(5, 0, 0, "X").unwrap();
    let delete = ChangeSet::splice(5, 4, 1, "").unwrap();

    let mut texts = Vec::new();
    for first_is_insert in [true, false] {
        let (mut state, _) = seeded("hello");
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
        state.add_client(c1);
        state.add_client(c2);

        if first_is_insert {
            state.update_state(c1, insert.clone(), 1).unwrap();
            state.update_state(c2, delete.clone(), 1).unwrap();
        } else {
            state.update_state(c2, delete.clone(), 1).unwrap();
            state.update_state(c1, insert.clone(), 1).unwrap();
        }
        texts.push(state.head_text().clone());
    }

    assert_eq!(texts[0], texts[1]);
    assert_eq!(texts[0].inserted_text(), "Xhell");
}

#[test]
fn stale_update_is_rebased_over_every_missed_revision() {
    let (mut state, author) = seeded("hello");
    let stale = Uuid::new_v4();
    state.add_client(stale);
    state.acknowledge(stale, 1).unwrap();

    let missed = [
        ChangeSet::splice(5, 0, 0, "A").unwrap(), // Ahello
        ChangeSet::splice(6, 1, 1, "").unwrap(),  // Aello
        ChangeSet::splice(5, 5, 0, "!").unwrap(), // Aello!
    ];
    for (i, cs) in missed.iter().enumerate() {
        state.update_state(author, cs.clone(), 1 + i).unwrap();
    }

    let edit = ChangeSet::splice(5, 2, 2, "LL").unwrap(); // heLLo
    let expected = missed
        .iter()
        .fold(edit.clone(), |acc, rev| follow(rev, &acc).unwrap());

    let result = state.update_state(stale, edit, 1).unwrap();
    assert_eq!(result.revision_number, 5);
    assert_eq!(result.change_set, expected);
    assert_eq!(state.text(), "AeLLo!");
}

#[test]
fn replaying_the_log_reproduces_head_text() {
    let (mut state, author) = seeded("the log");
    let other = Uuid::new_v4();
    state.add_client(other);
    state
        .update_state(author, ChangeSet::splice(7, 0, 3, "a").unwrap(), 1)
        .unwrap();
    state
        .update_state(other, ChangeSet::splice(7, 7, 0, " is truth").unwrap(), 1)
        .unwrap();

    let replayed = state
        .revisions()
        .iter()
        .try_fold(ChangeSet::identity(0), |acc, record| {
            compose(&acc, &record.change_set)
        })
        .unwrap();
    assert_eq!(&replayed, state.head_text());
    assert_eq!(state.text(), "a log is truth");

    // Catching up from the empty document gives the same result in one step.
    let caught_up = state.fast_forward(other, 0).unwrap();
    assert_eq!(caught_up.revision_number, 3);
    assert_eq!(&caught_up.change_set, state.head_text());
}

#[test]
fn compose_to_empty_document_is_pure_delete() {
    let (mut state, author) = seeded("gone");
    state
        .update_state(author, ChangeSet::splice(4, 0, 4, "").unwrap(), 1)
        .unwrap();
    assert_eq!(state.text(), "");
    assert_eq!(state.head_text().end_len(), 0);
    assert!(state.head_text().ops().is_empty());
}

/// Two client documents and one server, exchanging messages by hand.
#[test]
fn two_client_documents_converge_through_the_server() {
    let mut server = DocumentState::new();
    let (id1, id2) = (Uuid::new_v4(), Uuid::new_v4());
    let mut clients = [ClientDocument::new(6), ClientDocument::new(6)];
    for (id, client) in [id1, id2].into_iter().zip(clients.iter_mut()) {
        let revision = server.add_client(id);
        client.connect();
        client
            .receive_head(server.head_text().clone(), revision)
            .unwrap();
    }

    clients[0].local_edit(&EditEvent::insert(0, "shared ")).unwrap();
    clients[1].local_edit(&EditEvent::insert(0, "text")).unwrap();

    let out1 = clients[0].take_outgoing().unwrap().unwrap();
    let out2 = clients[1].take_outgoing().unwrap().unwrap();

    let rev1 = server
        .update_state(id1, out1.change_set, out1.revision_number)
        .unwrap();
    let rev2 = server
        .update_state(id2, out2.change_set, out2.revision_number)
        .unwrap();

    // Delivery in revision order: each client sees its own ack and the
    // other's update.
    clients[0].acknowledge(rev1.revision_number).unwrap();
    let applied = clients[0]
        .apply_server_update(&rev2.change_set, rev2.revision_number)
        .unwrap();
    assert!(matches!(applied, Reconciled::Applied { .. }));

    clients[1]
        .apply_server_update(&rev1.change_set, rev1.revision_number)
        .unwrap();
    clients[1].acknowledge(rev2.revision_number).unwrap();

    let text = server.text().to_string();
    assert_eq!(clients[0].text().unwrap(), text);
    assert_eq!(clients[1].text().unwrap(), text);
    assert_eq!(text.chars().count(), "shared text".chars().count());
}
