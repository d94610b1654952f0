use crate::signer::Signer;
use crate::{Error, Result};

use std::collections::HashSet;
use tnostr::{Filter, Note, NoteBuilder, NoteId, ProfileMetadata, Pubkey, RelayPool};
use tracing::debug;

async fn publish_checked(pool: &RelayPool, note: &Note) -> Result<()> {
    let acks = pool.publish(note).await.map_err(Error::Wire)?;
    if acks.iter().all(|ack| !ack.accepted) {
        return Err(Error::PublishFailed);
    }
    for ack in acks.iter().filter(|ack| !ack.accepted) {
        debug!("relay {} refused {}: {}", ack.relay, note.id.hex(), ack.message);
    }
    Ok(())
}

async fn fetch_target(pool: &RelayPool, target: NoteId) -> Result<Note> {
    pool.fetch_one(Filter::new().ids([target]).limit(1))
        .await
        .ok_or(Error::TargetNotFound)
}

/// Publish a plain kind-1 note.
pub async fn publish_note(pool: &RelayPool, signer: &dyn Signer, content: &str) -> Result<Note> {
    if content.trim().is_empty() {
        return Err(Error::EmptyInput);
    }
    let unsigned = NoteBuilder::new()
        .kind(1)
        .content(content)
        .unsigned(signer.pubkey());
    let note = signer.sign(unsigned).await?;
    publish_checked(pool, &note).await?;
    Ok(note)
}

/// The thread root of a note: the first `e` tag explicitly marked
/// `root`, falling back to the first `e` tag when nothing is marked.
/// `reply` markers never influence root selection.
pub fn thread_root(note: &Note) -> Option<NoteId> {
    let e_tags: Vec<&Vec<String>> = note
        .tags
        .iter()
        .filter(|t| t.first().map(String::as_str) == Some("e"))
        .collect();

    let chosen = e_tags
        .iter()
        .find(|t| t.get(3).map(String::as_str) == Some("root"))
        .or_else(|| e_tags.first())?;
    NoteId::from_hex(chosen.get(1)?).ok()
}

/// Tag set for a reply. A parent with no `e` tags becomes the thread
/// root; otherwise every parent `e` tag is carried forward and a
/// `reply`-marked tag pointing at the parent is appended. `p` tags name
/// the parent author first, then the parent's own `p` tags, as a set.
pub fn reply_tags(parent: &Note) -> Vec<Vec<String>> {
    let mut tags: Vec<Vec<String>> = Vec::new();

    let parent_e: Vec<&Vec<String>> = parent
        .tags
        .iter()
        .filter(|t| t.first().map(String::as_str) == Some("e"))
        .collect();

    if parent_e.is_empty() {
        // replying to a post that isn't in a thread yet
        tags.push(vec![
            "e".to_owned(),
            parent.id.hex(),
            String::new(),
            "root".to_owned(),
        ]);
    } else {
        for tag in parent_e {
            tags.push(tag.clone());
        }
        tags.push(vec![
            "e".to_owned(),
            parent.id.hex(),
            String::new(),
            "reply".to_owned(),
        ]);
    }

    let mut seen_p: HashSet<String> = HashSet::new();
    seen_p.insert(parent.pubkey.hex());
    tags.push(vec!["p".to_owned(), parent.pubkey.hex()]);
    for pk in parent.tag_values("p") {
        if seen_p.insert(pk.to_owned()) {
            tags.push(vec!["p".to_owned(), pk.to_owned()]);
        }
    }

    tags
}

/// Reply to an existing note, chaining the thread tags.
pub async fn reply(
    pool: &RelayPool,
    signer: &dyn Signer,
    target: NoteId,
    content: &str,
) -> Result<Note> {
    if content.trim().is_empty() {
        return Err(Error::EmptyInput);
    }
    let parent = fetch_target(pool, target).await?;

    let mut builder = NoteBuilder::new().kind(1).content(content);
    for tag in reply_tags(&parent) {
        builder = builder.tag(tag);
    }
    let note = signer.sign(builder.unsigned(signer.pubkey())).await?;
    publish_checked(pool, &note).await?;
    Ok(note)
}

/// Repost a note (kind 6). The reposted event rides in the content.
pub async fn repost(pool: &RelayPool, signer: &dyn Signer, target: NoteId) -> Result<Note> {
    let reposted = fetch_target(pool, target).await?;

    let unsigned = NoteBuilder::new()
        .kind(6)
        .content(&reposted.to_json()?)
        .tag(vec!["e".to_owned(), reposted.id.hex()])
        .tag(vec!["p".to_owned(), reposted.pubkey.hex()])
        .unsigned(signer.pubkey());
    let note = signer.sign(unsigned).await?;
    publish_checked(pool, &note).await?;
    Ok(note)
}

/// React to a note (kind 7). `reaction` is `+`, `-` or a custom payload.
pub async fn react(
    pool: &RelayPool,
    signer: &dyn Signer,
    target: NoteId,
    reaction: &str,
) -> Result<Note> {
    if reaction.is_empty() {
        return Err(Error::EmptyInput);
    }
    let reacted = fetch_target(pool, target).await?;

    let mut builder = NoteBuilder::new().kind(7).content(reaction);
    for tag in reacted
        .tags
        .iter()
        .filter(|t| matches!(t.first().map(String::as_str), Some("e") | Some("p")))
    {
        builder = builder.tag(tag.clone());
    }
    builder = builder
        .tag(vec!["e".to_owned(), reacted.id.hex()])
        .tag(vec!["p".to_owned(), reacted.pubkey.hex()]);

    let note = signer.sign(builder.unsigned(signer.pubkey())).await?;
    publish_checked(pool, &note).await?;
    Ok(note)
}

/// The freshest kind-3 contact list this author has published.
async fn fetch_contact_list(pool: &RelayPool, author: Pubkey) -> Option<Note> {
    pool.fetch_all(vec![Filter::new().authors([author]).kinds([3]).limit(1)])
        .await
        .into_iter()
        .max_by_key(|note| note.created_at)
}

/// Contact-list tags after adding or removing one contact. The `p` set
/// is deduplicated; everything else (relay tags etc) is carried as is.
fn edited_contact_tags(current: Option<&Note>, add: Option<&Pubkey>, remove: Option<&Pubkey>) -> Vec<Vec<String>> {
    let mut tags: Vec<Vec<String>> = Vec::new();
    let mut seen_p: HashSet<String> = HashSet::new();
    let removed = remove.map(|pk| pk.hex());

    if let Some(note) = current {
        for tag in &note.tags {
            if tag.first().map(String::as_str) == Some("p") {
                let Some(pk) = tag.get(1) else { continue };
                if Some(pk) == removed.as_ref() || !seen_p.insert(pk.clone()) {
                    continue;
                }
            }
            tags.push(tag.clone());
        }
    }

    if let Some(pk) = add {
        if seen_p.insert(pk.hex()) {
            tags.push(vec!["p".to_owned(), pk.hex()]);
        }
    }

    tags
}

/// Follow a pubkey: read-modify-write of the kind-3 contact list.
/// Following someone already followed leaves a single `p` entry.
pub async fn follow(pool: &RelayPool, signer: &dyn Signer, contact: Pubkey) -> Result<Note> {
    let current = fetch_contact_list(pool, signer.pubkey()).await;
    let tags = edited_contact_tags(current.as_ref(), Some(&contact), None);
    publish_contact_list(pool, signer, current.as_ref(), tags).await
}

/// Unfollow a pubkey, dropping every `p` entry that names it.
pub async fn unfollow(pool: &RelayPool, signer: &dyn Signer, contact: Pubkey) -> Result<Note> {
    let current = fetch_contact_list(pool, signer.pubkey()).await;
    let tags = edited_contact_tags(current.as_ref(), None, Some(&contact));
    publish_contact_list(pool, signer, current.as_ref(), tags).await
}

async fn publish_contact_list(
    pool: &RelayPool,
    signer: &dyn Signer,
    current: Option<&Note>,
    tags: Vec<Vec<String>>,
) -> Result<Note> {
    let mut builder = NoteBuilder::new()
        .kind(3)
        .content(current.map(|n| n.content.as_str()).unwrap_or(""));
    for tag in tags {
        builder = builder.tag(tag);
    }
    let note = signer.sign(builder.unsigned(signer.pubkey())).await?;
    publish_checked(pool, &note).await?;
    Ok(note)
}

/// Resolve the contact list and fetch recent notes from the contacts,
/// newest first. Transport order is not time order, so the sort here is
/// explicit.
pub async fn fetch_feed(pool: &RelayPool, author: Pubkey, limit: u16) -> Result<Vec<Note>> {
    let contacts = fetch_contact_list(pool, author)
        .await
        .ok_or(Error::EmptyContactList)?;

    let authors: Vec<Pubkey> = contacts
        .tag_values("p")
        .filter_map(|pk| Pubkey::parse(pk).ok())
        .collect();
    if authors.is_empty() {
        return Err(Error::EmptyContactList);
    }

    let mut notes = pool
        .fetch_all(vec![Filter::new().authors(authors).kinds([1]).limit(limit)])
        .await;
    notes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    notes.truncate(limit as usize);
    Ok(notes)
}

/// Publish kind-0 profile metadata.
pub async fn set_profile(
    pool: &RelayPool,
    signer: &dyn Signer,
    profile: &ProfileMetadata,
) -> Result<Note> {
    let unsigned = NoteBuilder::new()
        .kind(0)
        .content(&profile.to_json()?)
        .unsigned(signer.pubkey());
    let note = signer.sign(unsigned).await?;
    publish_checked(pool, &note).await?;
    Ok(note)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tnostr::{FullKeypair, NoteBuilder};

    fn note_with_tags(tags: Vec<Vec<String>>) -> Note {
        let kp = FullKeypair::generate();
        let mut builder = NoteBuilder::new().kind(1).content("parent");
        for tag in tags {
            builder = builder.tag(tag);
        }
        builder.sign(kp.to_filled()).unwrap()
    }

    fn e_tag(id: &str, marker: &str) -> Vec<String> {
        vec!["e".to_owned(), id.to_owned(), String::new(), marker.to_owned()]
    }

    #[test]
    fn replying_to_a_bare_note_marks_it_root() {
        let parent = note_with_tags(vec![]);
        let tags = reply_tags(&parent);

        assert_eq!(
            tags[0],
            vec!["e".to_owned(), parent.id.hex(), String::new(), "root".to_owned()]
        );
        assert_eq!(tags[1], vec!["p".to_owned(), parent.pubkey.hex()]);
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn replying_within_a_thread_carries_ancestors() {
        let root_id = "11".repeat(32);
        let mid_id = "22".repeat(32);
        let other_p = "33".repeat(32);
        let parent = note_with_tags(vec![
            e_tag(&root_id, "root"),
            e_tag(&mid_id, "reply"),
            vec!["p".to_owned(), other_p.clone()],
        ]);

        let tags = reply_tags(&parent);

        // ancestors carried in order, then the new reply marker
        assert_eq!(tags[0], e_tag(&root_id, "root"));
        assert_eq!(tags[1], e_tag(&mid_id, "reply"));
        assert_eq!(tags[2], e_tag(&parent.id.hex(), "reply"));
        // parent author first, then the parent's p tags
        assert_eq!(tags[3], vec!["p".to_owned(), parent.pubkey.hex()]);
        assert_eq!(tags[4], vec!["p".to_owned(), other_p]);
    }

    #[test]
    fn reply_p_tags_are_a_set() {
        // parent that already p-tags its own author
        let kp = FullKeypair::generate();
        let parent = NoteBuilder::new()
            .kind(1)
            .content("x")
            .tag(vec!["p".to_owned(), kp.pubkey.hex()])
            .sign(kp.to_filled())
            .unwrap();

        let tags = reply_tags(&parent);
        let p_count = tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some("p"))
            .count();
        assert_eq!(p_count, 1);
    }

    #[test]
    fn root_marker_wins_over_position() {
        let a = "aa".repeat(32);
        let b = "bb".repeat(32);
        let note = note_with_tags(vec![e_tag(&a, "reply"), e_tag(&b, "root")]);
        assert_eq!(thread_root(&note), Some(NoteId::from_hex(&b).unwrap()));
    }

    #[test]
    fn unmarked_first_e_tag_is_the_root() {
        let a = "aa".repeat(32);
        let b = "bb".repeat(32);
        let note = note_with_tags(vec![
            vec!["e".to_owned(), a.clone()],
            vec!["e".to_owned(), b],
        ]);
        assert_eq!(thread_root(&note), Some(NoteId::from_hex(&a).unwrap()));
    }

    #[test]
    fn following_twice_keeps_one_entry() {
        let contact = Pubkey::new([5; 32]);
        let current = note_with_tags(vec![
            vec!["p".to_owned(), contact.hex()],
            vec!["r".to_owned(), "wss://relay.example.com".to_owned()],
        ]);

        let tags = edited_contact_tags(Some(&current), Some(&contact), None);

        let p_entries: Vec<&Vec<String>> = tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some("p"))
            .collect();
        assert_eq!(p_entries.len(), 1);
        assert_eq!(p_entries[0][1], contact.hex());
        // relay tags ride along untouched
        assert!(tags
            .iter()
            .any(|t| t.first().map(String::as_str) == Some("r")));
    }

    #[test]
    fn unfollow_removes_every_matching_entry() {
        let contact = Pubkey::new([5; 32]);
        let kept = Pubkey::new([6; 32]);
        let current = note_with_tags(vec![
            vec!["p".to_owned(), contact.hex()],
            vec!["p".to_owned(), kept.hex()],
            vec!["p".to_owned(), contact.hex()],
        ]);

        let tags = edited_contact_tags(Some(&current), None, Some(&contact));

        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0], vec!["p".to_owned(), kept.hex()]);
    }

    #[test]
    fn follow_with_no_existing_list_starts_one() {
        let contact = Pubkey::new([5; 32]);
        let tags = edited_contact_tags(None, Some(&contact), None);
        assert_eq!(tags, vec![vec!["p".to_owned(), contact.hex()]]);
    }
}
