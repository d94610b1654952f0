mod common;

use common::{fast_pool_config, pool_for, TestRelay};
use notepush::{actions, Error, LocalSigner, Signer};
use tnostr::{Filter, FullKeypair, NoteBuilder, NoteId, ProfileMetadata, RelayPool};

fn local_signer() -> LocalSigner {
    LocalSigner::new(FullKeypair::generate())
}

#[tokio::test]
async fn publishing_hello_produces_a_verifiable_kind1() {
    let relay = TestRelay::start().await;
    let pool = pool_for(&relay).await;
    let signer = local_signer();

    let note = actions::publish_note(&pool, &signer, "hello").await.unwrap();

    assert_eq!(note.kind, 1);
    assert_eq!(note.content, "hello");
    assert!(note.tags.is_empty());
    assert_eq!(note.pubkey, signer.pubkey());
    note.verify().unwrap();

    // and it actually landed on the relay
    let stored = pool.fetch_one(Filter::new().ids([note.id])).await.unwrap();
    assert_eq!(stored.id, note.id);
}

#[tokio::test]
async fn empty_content_fails_before_any_network_call() {
    let pool = RelayPool::new(fast_pool_config()); // no relays at all
    let signer = local_signer();

    assert!(matches!(
        actions::publish_note(&pool, &signer, "   ").await,
        Err(Error::EmptyInput)
    ));
}

#[tokio::test]
async fn publish_with_no_accepting_relay_fails_hard() {
    let pool = RelayPool::new(fast_pool_config());
    let signer = local_signer();

    assert!(matches!(
        actions::publish_note(&pool, &signer, "nowhere to go").await,
        Err(Error::PublishFailed)
    ));
}

#[tokio::test]
async fn replying_to_a_missing_target_is_target_not_found() {
    let relay = TestRelay::start().await;
    let pool = pool_for(&relay).await;
    let signer = local_signer();

    let result = actions::reply(&pool, &signer, NoteId::new([0x42; 32]), "into the void").await;
    assert!(matches!(result, Err(Error::TargetNotFound)));
}

#[tokio::test]
async fn replies_chain_thread_tags_from_the_fetched_parent() {
    let relay = TestRelay::start().await;
    let pool = pool_for(&relay).await;
    let op = local_signer();
    let replier = local_signer();

    let parent = actions::publish_note(&pool, &op, "thread start").await.unwrap();
    let child = actions::reply(&pool, &replier, parent.id, "first!").await.unwrap();

    assert_eq!(
        child.tags[0],
        vec![
            "e".to_owned(),
            parent.id.hex(),
            String::new(),
            "root".to_owned()
        ]
    );
    assert!(child
        .tags
        .iter()
        .any(|t| t.first().map(String::as_str) == Some("p") && t[1] == op.pubkey().hex()));
}

#[tokio::test]
async fn reacting_references_the_target() {
    let relay = TestRelay::start().await;
    let pool = pool_for(&relay).await;
    let op = local_signer();
    let reactor = local_signer();

    let target = actions::publish_note(&pool, &op, "nice take").await.unwrap();
    let reaction = actions::react(&pool, &reactor, target.id, "+").await.unwrap();

    assert_eq!(reaction.kind, 7);
    assert_eq!(reaction.content, "+");
    assert!(reaction.tags.contains(&vec!["e".to_owned(), target.id.hex()]));
    assert!(reaction
        .tags
        .contains(&vec!["p".to_owned(), op.pubkey().hex()]));
}

#[tokio::test]
async fn reposts_carry_the_original_event() {
    let relay = TestRelay::start().await;
    let pool = pool_for(&relay).await;
    let op = local_signer();
    let booster = local_signer();

    let target = actions::publish_note(&pool, &op, "signal").await.unwrap();
    let repost = actions::repost(&pool, &booster, target.id).await.unwrap();

    assert_eq!(repost.kind, 6);
    let carried = tnostr::Note::from_json(&repost.content).unwrap();
    assert_eq!(carried.id, target.id);
}

#[tokio::test]
async fn following_twice_leaves_a_single_contact_entry() {
    let relay = TestRelay::start().await;
    let pool = pool_for(&relay).await;
    let signer = local_signer();
    let contact = FullKeypair::generate().pubkey;

    actions::follow(&pool, &signer, contact).await.unwrap();
    actions::follow(&pool, &signer, contact).await.unwrap();

    let lists = pool
        .fetch_all(vec![Filter::new().authors([signer.pubkey()]).kinds([3])])
        .await;
    let latest = lists.iter().max_by_key(|n| n.created_at).unwrap();

    let entries: Vec<&str> = latest.tag_values("p").collect();
    assert_eq!(entries, vec![contact.hex().as_str()]);
}

#[tokio::test]
async fn unfollow_drops_the_contact() {
    let relay = TestRelay::start().await;
    let pool = pool_for(&relay).await;
    let signer = local_signer();
    let keep = FullKeypair::generate().pubkey;
    let unwanted = FullKeypair::generate().pubkey;

    actions::follow(&pool, &signer, keep).await.unwrap();
    actions::follow(&pool, &signer, unwanted).await.unwrap();
    let after = actions::unfollow(&pool, &signer, unwanted).await.unwrap();

    let entries: Vec<&str> = after.tag_values("p").collect();
    assert_eq!(entries, vec![keep.hex().as_str()]);
}

#[tokio::test]
async fn feed_is_newest_first_and_bounded() {
    let relay = TestRelay::start().await;
    let pool = pool_for(&relay).await;
    let me = local_signer();
    let author = FullKeypair::generate();

    actions::follow(&pool, &me, author.pubkey).await.unwrap();

    for (content, created_at) in [("oldest", 100), ("middle", 200), ("newest", 300)] {
        let note = NoteBuilder::new()
            .kind(1)
            .content(content)
            .created_at(created_at)
            .sign(author.to_filled())
            .unwrap();
        pool.publish(&note).await.unwrap();
    }

    let feed = actions::fetch_feed(&pool, me.pubkey(), 2).await.unwrap();

    assert_eq!(feed.len(), 2);
    assert_eq!(feed[0].content, "newest");
    assert_eq!(feed[1].content, "middle");
}

#[tokio::test]
async fn feed_without_contacts_says_so() {
    let relay = TestRelay::start().await;
    let pool = pool_for(&relay).await;
    let me = local_signer();

    assert!(matches!(
        actions::fetch_feed(&pool, me.pubkey(), 10).await,
        Err(Error::EmptyContactList)
    ));
}

#[tokio::test]
async fn profile_metadata_round_trips_through_kind0() {
    let relay = TestRelay::start().await;
    let pool = pool_for(&relay).await;
    let signer = local_signer();

    let profile = ProfileMetadata {
        name: Some("flotilla".to_owned()),
        about: Some("client runtime tests".to_owned()),
        ..Default::default()
    };
    let note = actions::set_profile(&pool, &signer, &profile).await.unwrap();

    assert_eq!(note.kind, 0);
    let stored = pool
        .fetch_one(Filter::new().authors([signer.pubkey()]).kinds([0]))
        .await
        .unwrap();
    assert_eq!(ProfileMetadata::from_json(&stored.content).unwrap(), profile);
}
