//! File operations: the only way cache records are mutated.
//!
//! Every mutation of a workspace whose backend is not the cache itself marks
//! the record dirty and appends a queue entry in the same transaction, so
//! the change reaches the backend eventually even if the process dies right
//! after. Creation checks
//! the target path first so nothing is ever silently overwritten.

use crate::Context;
use crate::error::{CacheResultExt, ErrorKind, Result};
use exn::ResultExt;
use tracing::{debug, instrument};
use verve_cache::models::now;
use verve_cache::models::path_key;
use verve_cache::{CachedFile, ChangeSet, Metadata, NewSyncEntry, WorkspaceType};
use verve_storage::path;

/// Join a name onto a parent directory. Root-level parents (empty or `/`)
/// produce an unprefixed path.
pub fn join_path(parent: &str, name: &str) -> Result<String> {
    path::join(parent, name).or_raise(|| ErrorKind::InvalidPath(format!("{parent} + {name}")))
}

fn normalize(raw: &str) -> Result<String> {
    path::normalize(raw).or_raise(|| ErrorKind::InvalidPath(raw.to_string()))
}

/// Identity for a new record. The path is used unless a record that has
/// since been renamed away still holds that identity.
pub(crate) async fn fresh_id(ctx: &Context, path: &str, workspace_id: Option<&str>) -> Result<String> {
    if ctx.repo.get(path, workspace_id).await.or_store()?.is_none() {
        return Ok(path.to_string());
    }
    let mut attempt = now().unix_timestamp_nanos();
    loop {
        let candidate = format!("{path}#{attempt:x}");
        if ctx.repo.get(&candidate, workspace_id).await.or_store()?.is_none() {
            return Ok(candidate);
        }
        attempt += 1;
    }
}

/// Persist a record and, for propagating workspaces, queue it. Stamps the
/// record with the revision the store gave it.
async fn commit(ctx: &Context, file: &mut CachedFile, entry: impl FnOnce(&CachedFile) -> NewSyncEntry) -> Result<()> {
    let mut changes = ChangeSet::new();
    changes.upsert(file.clone());
    if file.workspace_type.propagates() {
        changes.enqueue(entry(file));
    }
    let revisions = ctx.repo.apply(&changes).await.or_store()?;
    if let Some(revision) = revisions.first() {
        file.revision = *revision;
    }
    debug!(path = %file.path, queued = file.workspace_type.propagates(), "committed");
    Ok(())
}

/// Write a file's content, creating the record if the path is free.
///
/// Metadata keys given here are merged into the record's existing metadata.
/// Fails with [`AlreadyExists`](ErrorKind::AlreadyExists) if a directory
/// occupies the path.
#[instrument(skip(ctx, content, metadata), fields(workspace = ?workspace_id))]
pub async fn save_file(
    ctx: &Context,
    path: &str,
    content: &str,
    workspace_type: WorkspaceType,
    metadata: Option<Metadata>,
    workspace_id: Option<&str>,
) -> Result<CachedFile> {
    let path = normalize(path)?;
    let mut file = match ctx.repo.get_by_path(&path, workspace_id).await.or_store()? {
        Some(existing) if existing.is_dir() => exn::bail!(ErrorKind::AlreadyExists(path)),
        Some(mut existing) => {
            existing.content = content.to_string();
            existing.workspace_type = workspace_type;
            existing.last_modified = now();
            existing
        },
        None => {
            let mut file = CachedFile::file(&path, content, workspace_type, workspace_id.map(str::to_string));
            file.id = fresh_id(ctx, &path, workspace_id).await?;
            file
        },
    };
    if let Some(metadata) = metadata {
        file.metadata.extend(metadata);
    }
    file.dirty = workspace_type.propagates();
    commit(ctx, &mut file, NewSyncEntry::put).await?;
    Ok(file)
}

/// Create a directory record. Creating a directory that already exists is a
/// no-op; a file at the path is [`AlreadyExists`](ErrorKind::AlreadyExists).
#[instrument(skip(ctx), fields(workspace = ?workspace_id))]
pub async fn create_directory(
    ctx: &Context,
    path: &str,
    workspace_type: WorkspaceType,
    workspace_id: Option<&str>,
) -> Result<CachedFile> {
    let path = normalize(path)?;
    match ctx.repo.get_by_path(&path, workspace_id).await.or_store()? {
        Some(existing) if existing.is_dir() => return Ok(existing),
        Some(_) => exn::bail!(ErrorKind::AlreadyExists(path)),
        None => {},
    }
    let mut dir = CachedFile::directory(&path, workspace_type, workspace_id.map(str::to_string));
    dir.id = fresh_id(ctx, &path, workspace_id).await?;
    dir.dirty = workspace_type.propagates();
    commit(ctx, &mut dir, NewSyncEntry::put).await?;
    Ok(dir)
}

/// Create a new file named `name` inside `parent`.
pub async fn create_file(
    ctx: &Context,
    parent: &str,
    name: &str,
    content: &str,
    workspace_type: WorkspaceType,
    workspace_id: Option<&str>,
) -> Result<CachedFile> {
    let path = join_path(parent, name)?;
    if exists_in_workspace(ctx, &path, workspace_id).await? {
        exn::bail!(ErrorKind::AlreadyExists(path));
    }
    save_file(ctx, &path, content, workspace_type, None, workspace_id).await
}

/// Create a new folder named `name` inside `parent`.
pub async fn create_folder(
    ctx: &Context,
    parent: &str,
    name: &str,
    workspace_type: WorkspaceType,
    workspace_id: Option<&str>,
) -> Result<CachedFile> {
    let path = join_path(parent, name)?;
    if exists_in_workspace(ctx, &path, workspace_id).await? {
        exn::bail!(ErrorKind::AlreadyExists(path));
    }
    create_directory(ctx, &path, workspace_type, workspace_id).await
}

/// Whether a live record occupies the path.
pub async fn exists_in_workspace(ctx: &Context, path: &str, workspace_id: Option<&str>) -> Result<bool> {
    let path = normalize(path)?;
    Ok(ctx.repo.get_by_path(&path, workspace_id).await.or_store()?.is_some())
}

/// Read a record by path. With a `workspace_type`, records of any other
/// type are treated as absent.
pub async fn load_file(
    ctx: &Context,
    path: &str,
    workspace_type: Option<WorkspaceType>,
    workspace_id: Option<&str>,
) -> Result<Option<CachedFile>> {
    let path = normalize(path)?;
    let file = ctx.repo.get_by_path(&path, workspace_id).await.or_store()?;
    Ok(file.filter(|f| workspace_type.is_none_or(|kind| f.workspace_type == kind)))
}

/// Records in a workspace, ordered by path. With a directory, only the
/// records below it.
pub async fn list_files(ctx: &Context, dir: Option<&str>, workspace_id: Option<&str>) -> Result<Vec<CachedFile>> {
    let files = ctx.repo.list(workspace_id).await.or_store()?;
    let dir = match dir.map(|d| d.trim_end_matches('/')) {
        None | Some("") => return Ok(files),
        Some(dir) => normalize(dir)?,
    };
    Ok(files.into_iter().filter(|f| path::is_within(path_key(&f.path), path_key(&dir))).collect())
}

/// Records strictly below a directory, deepest first.
async fn descendants(ctx: &Context, dir: &CachedFile) -> Result<Vec<CachedFile>> {
    let mut below: Vec<_> = ctx
        .repo
        .list(dir.workspace_id.as_deref())
        .await
        .or_store()?
        .into_iter()
        .filter(|f| path::is_within(path_key(&f.path), dir.key()))
        .collect();
    below.sort_by_key(|f| std::cmp::Reverse(f.path.matches('/').count()));
    Ok(below)
}

/// Remove a record (a directory takes everything below it along). The
/// queued deletes carry the path each record had, since the records
/// themselves are gone by the time the queue gets to them.
#[instrument(skip(ctx), fields(workspace = ?workspace_id))]
pub async fn delete_file(ctx: &Context, path: &str, workspace_id: Option<&str>) -> Result<CachedFile> {
    let path = normalize(path)?;
    let file = ctx
        .repo
        .get_by_path(&path, workspace_id)
        .await
        .or_store()?
        .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
    let mut doomed = match file.is_dir() {
        true => descendants(ctx, &file).await?,
        false => Vec::new(),
    };
    doomed.push(file.clone());
    let mut changes = ChangeSet::new();
    for record in &doomed {
        changes.remove(&record.id, record.workspace_id.as_deref());
        if record.workspace_type.propagates() {
            changes.enqueue(NewSyncEntry::delete(record));
        }
    }
    ctx.repo.apply(&changes).await.or_store()?;
    debug!(removed = doomed.len(), "deleted");
    Ok(file)
}

/// Move a record to a new path, keeping its identity (a directory takes
/// everything below it along).
///
/// The queued entries are puts that remember the old path, so backends that
/// can rename do, and the rest write at the new path and delete the old one.
#[instrument(skip(ctx), fields(workspace = ?workspace_id))]
pub async fn rename_file(ctx: &Context, old_path: &str, new_path: &str, workspace_id: Option<&str>) -> Result<CachedFile> {
    let (old_path, new_path) = (normalize(old_path)?, normalize(new_path)?);
    let file = ctx
        .repo
        .get_by_path(&old_path, workspace_id)
        .await
        .or_store()?
        .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(old_path.clone())))?;
    if path_key(&old_path) == path_key(&new_path) {
        return Ok(file);
    }
    if file.is_dir() && path::is_within(path_key(&new_path), path_key(&old_path)) {
        exn::bail!(ErrorKind::InvalidPath(new_path));
    }

    // Every destination is checked before anything moves.
    let mut moves = vec![(file.clone(), new_path.clone())];
    if file.is_dir() {
        for child in descendants(ctx, &file).await?.into_iter().rev() {
            let target = format!("{new_path}{}", &child.key()[file.key().len()..]);
            moves.push((child, target));
        }
    }
    for (_, target) in &moves {
        if exists_in_workspace(ctx, target, workspace_id).await? {
            exn::bail!(ErrorKind::AlreadyExists(target.clone()));
        }
    }

    let mut changes = ChangeSet::new();
    let mut moved = Vec::with_capacity(moves.len());
    for (mut record, target) in moves {
        let previous = record.path.clone();
        record.relocate(target);
        record.dirty = record.workspace_type.propagates();
        changes.upsert(record.clone());
        if record.workspace_type.propagates() {
            changes.enqueue(NewSyncEntry::rename(&record, previous));
        }
        moved.push(record);
    }
    let revisions = ctx.repo.apply(&changes).await.or_store()?;
    debug!(moved = moved.len(), "renamed");
    let mut renamed = moved.into_iter().next().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(old_path)))?;
    if let Some(revision) = revisions.first() {
        renamed.revision = *revision;
    }
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;
    use rstest::rstest;
    use verve_cache::{SyncOp, WorkspaceType};

    const WS: Option<&str> = Some("ws");

    #[tokio::test]
    async fn test_save_marks_dirty_and_queues() {
        let (ctx, _) = context().await;
        let file = save_file(&ctx, "/new-file.md", "hello world", WorkspaceType::Local, None, Some("ws-create"))
            .await
            .unwrap();
        assert!(file.dirty);
        assert_eq!(file.id, "/new-file.md");
        let stored = ctx.repo.get("/new-file.md", Some("ws-create")).await.unwrap().unwrap();
        assert!(stored.dirty);
        let queued = ctx.queue.list().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].op, SyncOp::Put);
        assert_eq!(queued[0].target_id, "/new-file.md");
    }

    #[tokio::test]
    async fn test_browser_workspaces_never_queue() {
        let (ctx, _) = context().await;
        let file = save_file(&ctx, "/a.md", "x", WorkspaceType::Browser, None, WS).await.unwrap();
        assert!(!file.dirty);
        create_directory(&ctx, "/dir", WorkspaceType::Browser, WS).await.unwrap();
        rename_file(&ctx, "/a.md", "/b.md", WS).await.unwrap();
        delete_file(&ctx, "/b.md", WS).await.unwrap();
        assert!(ctx.queue.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_updates_in_place_and_merges_metadata() {
        let (ctx, _) = context().await;
        let mut metadata = Metadata::new();
        metadata.insert("synced_version".to_string(), "3".into());
        save_file(&ctx, "/a.md", "one", WorkspaceType::Local, Some(metadata), WS).await.unwrap();
        let mut extra = Metadata::new();
        extra.insert("tag".to_string(), "x".into());
        let file = save_file(&ctx, "/a.md", "two", WorkspaceType::Local, Some(extra), WS).await.unwrap();
        assert_eq!(file.content, "two");
        assert_eq!(file.synced_version(), Some("3"));
        assert_eq!(file.metadata["tag"], "x");
        assert_eq!(ctx.repo.list(WS).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_collision() {
        let (ctx, _) = context().await;
        create_file(&ctx, "/", "a.md", "original", WorkspaceType::Local, WS).await.unwrap();
        let err = create_file(&ctx, "/", "a.md", "other", WorkspaceType::Local, WS).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
        let err = create_folder(&ctx, "", "a.md", WorkspaceType::Local, WS).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
        let stored = load_file(&ctx, "a.md", None, WS).await.unwrap().unwrap();
        assert_eq!(stored.content, "original");
        assert!(!stored.is_dir());
    }

    #[tokio::test]
    async fn test_save_cannot_replace_directory() {
        let (ctx, _) = context().await;
        create_folder(&ctx, "/", "notes", WorkspaceType::Local, WS).await.unwrap();
        let err = save_file(&ctx, "notes", "x", WorkspaceType::Local, None, WS).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
        // Directories are idempotent.
        assert!(create_directory(&ctx, "notes", WorkspaceType::Local, WS).await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_same_path_in_other_workspace_is_fine() {
        let (ctx, _) = context().await;
        create_file(&ctx, "/", "a.md", "one", WorkspaceType::Local, Some("one")).await.unwrap();
        create_file(&ctx, "/", "a.md", "two", WorkspaceType::Local, Some("two")).await.unwrap();
        assert!(exists_in_workspace(&ctx, "a.md", Some("one")).await.unwrap());
        assert!(!exists_in_workspace(&ctx, "a.md", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_leading_slash_is_the_same_file() {
        let (ctx, _) = context().await;
        let created = create_file(&ctx, "/", "root.md", "one", WorkspaceType::Local, WS).await.unwrap();
        assert_eq!(created.path, "root.md");
        assert!(exists_in_workspace(&ctx, "/root.md", WS).await.unwrap());
        let err = create_file(&ctx, "", "/root.md", "two", WorkspaceType::Local, WS).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
        let saved = save_file(&ctx, "/root.md", "two", WorkspaceType::Local, None, WS).await.unwrap();
        assert_eq!(saved.id, created.id);
        assert!(saved.revision > created.revision);
        assert_eq!(ctx.repo.list(WS).await.unwrap().len(), 1);

        // Respelling the path is not a move.
        let before = ctx.queue.list().await.unwrap().len();
        let same = rename_file(&ctx, "root.md", "/root.md", WS).await.unwrap();
        assert_eq!(same.path, "root.md");
        assert_eq!(ctx.queue.list().await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_rename_preserves_identity() {
        let (ctx, _) = context().await;
        let original = save_file(&ctx, "/old.md", "body", WorkspaceType::Local, None, WS).await.unwrap();
        let renamed = rename_file(&ctx, "/old.md", "/new.md", WS).await.unwrap();
        assert_eq!(renamed.id, original.id);
        assert_eq!(renamed.path, "/new.md");
        assert_eq!(renamed.name, "new.md");
        assert!(renamed.dirty);
        assert!(load_file(&ctx, "/old.md", None, WS).await.unwrap().is_none());
        let last = ctx.queue.list().await.unwrap().pop().unwrap();
        let payload = last.payload.unwrap();
        assert_eq!(payload.path, "/new.md");
        assert_eq!(payload.renamed_from.as_deref(), Some("/old.md"));
    }

    #[tokio::test]
    async fn test_recreating_a_renamed_path_gets_new_identity() {
        let (ctx, _) = context().await;
        save_file(&ctx, "/a.md", "first", WorkspaceType::Local, None, WS).await.unwrap();
        rename_file(&ctx, "/a.md", "/b.md", WS).await.unwrap();
        let again = save_file(&ctx, "/a.md", "second", WorkspaceType::Local, None, WS).await.unwrap();
        assert_ne!(again.id, "/a.md");
        let moved = load_file(&ctx, "/b.md", None, WS).await.unwrap().unwrap();
        assert_eq!(moved.id, "/a.md");
        assert_eq!(moved.content, "first");
    }

    #[tokio::test]
    async fn test_rename_rejects_occupied_target() {
        let (ctx, _) = context().await;
        save_file(&ctx, "/a.md", "a", WorkspaceType::Local, None, WS).await.unwrap();
        save_file(&ctx, "/b.md", "b", WorkspaceType::Local, None, WS).await.unwrap();
        let err = rename_file(&ctx, "/a.md", "/b.md", WS).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
        let err = rename_file(&ctx, "/missing.md", "/c.md", WS).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_directory_rename_and_delete_cascade() {
        let (ctx, _) = context().await;
        create_directory(&ctx, "/notes", WorkspaceType::Local, WS).await.unwrap();
        save_file(&ctx, "/notes/a.md", "a", WorkspaceType::Local, None, WS).await.unwrap();
        save_file(&ctx, "/notes/deep/b.md", "b", WorkspaceType::Local, None, WS).await.unwrap();
        save_file(&ctx, "/notes-other.md", "c", WorkspaceType::Local, None, WS).await.unwrap();

        rename_file(&ctx, "/notes", "/archive", WS).await.unwrap();
        let paths: Vec<_> = list_files(&ctx, Some("/archive"), WS).await.unwrap().into_iter().map(|f| f.path).collect();
        assert_eq!(paths, vec!["/archive/a.md", "/archive/deep/b.md"]);
        assert!(load_file(&ctx, "/notes-other.md", None, WS).await.unwrap().is_some());

        delete_file(&ctx, "/archive", WS).await.unwrap();
        let remaining: Vec<_> = list_files(&ctx, None, WS).await.unwrap().into_iter().map(|f| f.path).collect();
        assert_eq!(remaining, vec!["/notes-other.md"]);
        // Children are deleted before their parent.
        let deletes: Vec<_> = ctx
            .queue
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.op == SyncOp::Delete)
            .map(|e| e.payload.unwrap().path)
            .collect();
        assert_eq!(deletes, vec!["/archive/deep/b.md", "/archive/a.md", "/archive"]);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let (ctx, _) = context().await;
        let err = delete_file(&ctx, "/nope.md", WS).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_load_filters_by_workspace_type() {
        let (ctx, _) = context().await;
        save_file(&ctx, "/a.md", "a", WorkspaceType::Drive, None, WS).await.unwrap();
        assert!(load_file(&ctx, "/a.md", Some(WorkspaceType::Drive), WS).await.unwrap().is_some());
        assert!(load_file(&ctx, "/a.md", Some(WorkspaceType::Local), WS).await.unwrap().is_none());
    }

    #[rstest]
    #[case("", "root-new.md", "root-new.md")]
    #[case("/", "root-new.md", "root-new.md")]
    #[case("/notes", "a.md", "/notes/a.md")]
    fn test_join_path(#[case] parent: &str, #[case] name: &str, #[case] expected: &str) {
        assert_eq!(join_path(parent, name).unwrap(), expected);
    }

    #[test]
    fn test_join_path_rejects_nesting() {
        let err = join_path("/notes", "../a.md").unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }
}
