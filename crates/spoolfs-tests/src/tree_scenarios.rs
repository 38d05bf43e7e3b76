//! Merged-view scenarios: exists, open, list, create, and delete across
//! every combination of local, remote, temporary, and offline state.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::harness::{names, TestTree};
    use spoolfs_tree::{ConflictReason, MemoryRemote, QueueMethod, RemoteTree, TreeError};

    #[tokio::test]
    async fn test_exists_remote_only() {
        let t = TestTree::new();
        t.remote.add_file("/remote.txt", b"x");
        assert!(t.tree.exists("/remote.txt").await.unwrap());
        assert!(!t.tree.exists("/missing.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_local_only() {
        let t = TestTree::new();
        t.tree.create_file("/local.txt").await.unwrap();
        assert!(t.tree.exists("/local.txt").await.unwrap());
        assert_eq!(t.remote.calls().exists, 0);
    }

    #[tokio::test]
    async fn test_exists_temporary_ignores_remote() {
        let t = TestTree::new();
        // a remote file with a marker name is invisible through the tree
        t.remote.add_file("/.lock", b"x");
        assert!(!t.tree.exists("/.lock").await.unwrap());
        assert_eq!(t.remote.calls().exists, 0);

        t.tree.create_file("/.lock").await.unwrap();
        assert!(t.tree.exists("/.lock").await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_offline_cached_still_answers() {
        let t = TestTree::new();
        t.cached_file("/f", b"data").await;
        t.remote.set_offline(true);
        assert!(t.tree.exists("/f").await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_offline_uncached_propagates() {
        let t = TestTree::new();
        t.remote.set_offline(true);
        let err = t.tree.exists("/unknown").await.unwrap_err();
        assert!(matches!(err, TreeError::UpstreamUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_open_remote_directory() {
        let t = TestTree::new();
        t.remote.add_directory("/docs");
        let node = t.tree.open("/docs").await.unwrap();
        assert!(node.is_directory());
        assert_eq!(node.path(), "/docs");
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let t = TestTree::new();
        assert!(t.tree.open("/nope").await.unwrap_err().is_not_found());
        assert!(t.tree.open("/.nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_open_hidden_by_pending_delete() {
        let t = TestTree::new();
        t.cached_file("/f", b"x").await;
        t.tree.delete("/f").await.unwrap();
        assert!(t.tree.open("/f").await.unwrap_err().is_not_found());
        assert!(t.tree.read("/f").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_open_downloads_full_content() {
        let t = TestTree::new();
        let body = vec![7u8; 64 * 1024];
        t.remote.add_file("/big.bin", &body);
        let node = t.tree.open("/big.bin").await.unwrap();
        assert_eq!(node.size(), body.len() as u64);
        assert_eq!(t.tree.read("/big.bin").await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_list_single_path_pattern() {
        let t = TestTree::new();
        t.remote.add_file("/dir/a.txt", b"a");
        let matched = t.tree.list("/dir/a.txt").await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name(), "a.txt");

        assert!(t.tree.list("/dir/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_single_path_hidden_by_pending_delete() {
        let t = TestTree::new();
        t.cached_file("/dir/a", b"a").await;
        t.tree.delete("/dir/a").await.unwrap();
        assert!(t.tree.list("/dir/a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_root_patterns() {
        let t = TestTree::new();
        t.remote.add_file("/top.txt", b"x");
        t.tree.create_file("/mine.txt").await.unwrap();
        let star = t.tree.list("*").await.unwrap();
        assert_eq!(names(&star), vec!["mine.txt", "top.txt"]);
        // the listing cache serves the slash form of the same directory
        let slash_star = t.tree.list("/*").await.unwrap();
        assert_eq!(names(&slash_star), names(&star));
        assert_eq!(t.remote.calls().list, 1);
    }

    #[tokio::test]
    async fn test_list_hides_remote_file_with_pending_delete() {
        let t = TestTree::new();
        t.remote.add_file("/dir/doomed", b"x");
        t.remote.add_file("/dir/kept", b"x");
        t.cached_file("/dir/doomed", b"x").await;
        t.tree.delete("/dir/doomed").await.unwrap();
        let nodes = t.tree.list("/dir/*").await.unwrap();
        assert_eq!(names(&nodes), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_list_hides_remote_temporary_names() {
        let t = TestTree::new();
        t.remote.add_file("/dir/real", b"x");
        t.remote.add_file("/dir/.lock", b"y");
        let nodes = t.tree.list("/dir/*").await.unwrap();
        assert_eq!(names(&nodes), vec!["real"]);
        // consistent with the single-path operations
        assert!(!t.tree.exists("/dir/.lock").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_unknown_remote_directory_serves_local() {
        let t = TestTree::new();
        t.tree.create_file("/only-local/f").await.unwrap();
        let nodes = t.tree.list("/only-local/*").await.unwrap();
        assert_eq!(names(&nodes), vec!["f"]);
    }

    #[tokio::test]
    async fn test_list_offline_keeps_synced_files() {
        let t = TestTree::new();
        t.cached_file("/dir/f", b"x").await;
        t.remote.set_offline(true);
        let nodes = t.tree.list("/dir/*").await.unwrap();
        assert_eq!(names(&nodes), vec!["f"]);
        assert!(t.tree.cache_store().contains_file("/dir/f"));
    }

    #[tokio::test]
    async fn test_list_repairs_missing_work_metadata_for_remote_file() {
        let t = TestTree::new();
        t.remote.add_file_with_mtime("/dir/f", b"x", 1_000);
        // cached content whose sync metadata went missing
        t.tree.cache_store().put_file("/dir/f", b"x", 1_000).unwrap();
        assert!(t.tree.work_tree().get("/dir/f").is_none());

        let nodes = t.tree.list("/dir/*").await.unwrap();
        assert_eq!(names(&nodes), vec!["f"]);
        let repaired = t.tree.work_tree().get("/dir/f").unwrap();
        assert_eq!(repaired.last_synced, Some(1_000));
        assert!(!repaired.locally_created);
    }

    #[tokio::test]
    async fn test_list_repairs_missing_work_metadata_for_local_file() {
        let t = TestTree::new();
        t.remote.add_directory("/dir");
        t.tree.cache_store().put_file("/dir/f", b"x", 1_000).unwrap();

        let nodes = t.tree.list("/dir/*").await.unwrap();
        assert_eq!(names(&nodes), vec!["f"]);
        // no remote counterpart: treated as a local creation awaiting upload
        let repaired = t.tree.work_tree().get("/dir/f").unwrap();
        assert!(repaired.locally_created);
        assert_eq!(repaired.last_synced, None);
    }

    #[tokio::test]
    async fn test_list_propagates_remote_directory_deletion() {
        let t = TestTree::new();
        t.cached_file("/gone/f", b"x").await;
        t.remote.remove_directory("/gone");
        let nodes = t.tree.list("/*").await.unwrap();
        assert!(nodes.is_empty());
        assert!(!t.tree.cache_store().contains_dir("/gone"));
        assert!(!t.tree.cache_store().contains_file("/gone/f"));
    }

    #[tokio::test]
    async fn test_list_keeps_remote_deleted_directory_with_edits() {
        let mut t = TestTree::new();
        t.cached_file("/gone/f", b"x").await;
        t.tree.write("/gone/f", 0, b"edited").await.unwrap();
        t.remote.remove_directory("/gone");

        let nodes = t.tree.list("/*").await.unwrap();
        assert_eq!(names(&nodes), vec!["gone"]);
        assert!(t.tree.cache_store().contains_file("/gone/f"));
        let conflict = t.take_conflict().unwrap();
        assert_eq!(conflict.path, "/gone/f");
        assert_eq!(conflict.reason, ConflictReason::LocalEditsPending);
    }

    #[tokio::test]
    async fn test_list_keeps_locally_created_directory() {
        let t = TestTree::new();
        t.remote.set_offline(true);
        t.tree.create_directory("/fresh").await.unwrap();
        t.remote.set_offline(false);
        let nodes = t.tree.list("/*").await.unwrap();
        assert_eq!(names(&nodes), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_create_directory_eagerly_creates_remote() {
        let t = TestTree::new();
        t.tree.create_directory("/docs").await.unwrap();
        assert!(t.remote.exists("/docs").await.unwrap());
        assert!(!t.tree.work_tree().get("/docs").unwrap().locally_created);
        assert!(t.tree.queue().is_empty());
    }

    #[tokio::test]
    async fn test_create_directory_offline_degrades_to_local() {
        let t = TestTree::new();
        t.remote.set_offline(true);
        t.tree.create_directory("/docs").await.unwrap();
        assert!(t.tree.cache_store().contains_dir("/docs"));
        assert!(t.tree.work_tree().get("/docs").unwrap().locally_created);
    }

    #[tokio::test]
    async fn test_create_directory_twice_is_bad_state() {
        let t = TestTree::new();
        t.tree.create_directory("/d").await.unwrap();
        let err = t.tree.create_directory("/d").await.unwrap_err();
        assert!(matches!(err, TreeError::BadState { .. }));
    }

    #[tokio::test]
    async fn test_temporary_directory_stays_local() {
        let t = TestTree::new();
        t.tree.create_directory("/.staging").await.unwrap();
        assert!(t.tree.exists("/.staging").await.unwrap());
        assert_eq!(t.remote.calls().create_directory, 0);
        assert!(t.tree.work_tree().get("/.staging").is_none());
    }

    #[tokio::test]
    async fn test_delete_on_directory_is_bad_state() {
        let t = TestTree::new();
        t.tree.create_directory("/d").await.unwrap();
        let err = t.tree.delete("/d").await.unwrap_err();
        assert!(matches!(err, TreeError::BadState { .. }));
    }

    #[tokio::test]
    async fn test_delete_directory_on_file_is_bad_state() {
        let t = TestTree::new();
        t.tree.create_file("/f").await.unwrap();
        let err = t.tree.delete_directory("/f").await.unwrap_err();
        assert!(matches!(err, TreeError::BadState { .. }));
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_not_found() {
        let t = TestTree::new();
        assert!(t.tree.delete("/nope").await.unwrap_err().is_not_found());
        assert!(t.tree.delete("/.nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_uncached_remote_file_queues_delete() {
        let t = TestTree::new();
        t.remote.add_file("/r", b"x");
        t.tree.delete("/r").await.unwrap();
        t.expect_queued("/r", QueueMethod::Delete);
        // the remote copy waits for replay
        assert!(t.remote.exists("/r").await.unwrap());
        assert!(!t.tree.exists("/r").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_uncached_offline_queues_optimistically() {
        let t = TestTree::new();
        t.remote.add_file("/r", b"x");
        t.remote.set_offline(true);
        t.tree.delete("/r").await.unwrap();
        t.expect_queued("/r", QueueMethod::Delete);
    }

    #[tokio::test]
    async fn test_delete_directory_remote_only() {
        let t = TestTree::new();
        t.remote.add_file("/d/f", b"x");
        t.tree.delete_directory("/d").await.unwrap();
        assert!(!t.remote.exists("/d").await.unwrap());
        assert_eq!(t.remote.calls().delete_directory, 1);
    }

    #[tokio::test]
    async fn test_delete_directory_missing_is_not_found() {
        let t = TestTree::new();
        let err = t.tree.delete_directory("/nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_directory_local_only_skips_remote() {
        let t = TestTree::new();
        t.remote.set_offline(true);
        t.tree.create_directory("/local").await.unwrap();
        t.tree.create_file("/local/f").await.unwrap();
        t.remote.set_offline(false);

        // never-uploaded children are preserved by the delete gate
        t.tree.delete_directory("/local").await.unwrap();
        assert!(t.tree.cache_store().contains_file("/local/f"));

        // once synced, the purge completes without a remote directory call
        t.tree.mark_synced("/local/f").unwrap();
        t.tree.delete_directory("/local").await.unwrap();
        assert!(!t.tree.cache_store().contains_dir("/local"));
        assert_eq!(t.remote.calls().delete_directory, 0);
        assert!(t.tree.queue().is_empty());
    }

    #[tokio::test]
    async fn test_delete_directory_synced_removes_remote() {
        let t = TestTree::new();
        t.cached_file("/d/f", b"x").await;
        t.tree.open("/d").await.unwrap();
        t.tree.create_directory("/d/sub").await.ok();
        t.tree.delete_directory("/d").await.unwrap();
        assert!(!t.tree.cache_store().contains_dir("/d"));
        assert!(!t.remote.exists("/d").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_temporary_directory_never_calls_remote() {
        let t = TestTree::new();
        t.tree.create_directory("/.work").await.unwrap();
        t.tree.create_file("/.work/.scratch").await.unwrap();
        t.tree.delete_directory("/.work").await.unwrap();
        assert!(!t.tree.exists("/.work").await.unwrap());
        assert_eq!(t.remote.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_delete_local_directory_leaves_remote_untouched() {
        let t = TestTree::new();
        t.cached_file("/d/f", b"x").await;
        let conflicts = t.tree.delete_local_directory("/d").unwrap();
        assert!(conflicts.is_empty());
        assert!(!t.tree.cache_store().contains_dir("/d"));
        assert!(t.remote.exists("/d/f").await.unwrap());
        assert_eq!(t.remote.calls().delete, 0);
        assert_eq!(t.remote.calls().delete_directory, 0);
    }

    #[tokio::test]
    async fn test_delete_local_directory_reports_conflicts() {
        let t = TestTree::new();
        t.cached_file("/d/clean", b"x").await;
        t.tree.create_file("/d/dirty").await.unwrap();
        let conflicts = t.tree.delete_local_directory("/d").unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].path, "/d/dirty");
        assert_eq!(conflicts[0].reason, ConflictReason::NeverUploaded);
        assert!(!t.tree.cache_store().contains_file("/d/clean"));
        assert!(t.tree.cache_store().contains_file("/d/dirty"));
        assert!(t.tree.cache_store().contains_dir("/d"));
    }

    #[tokio::test]
    async fn test_recursive_delete_keeps_ancestors_of_survivors() {
        let t = TestTree::new();
        t.cached_file("/d/keep/clean", b"x").await;
        t.tree.create_file("/d/keep/dirty").await.unwrap();
        t.cached_file("/d/drop/clean", b"x").await;

        t.tree.delete_directory("/d").await.unwrap();
        // the branch holding the dirty leaf survives intact
        assert!(t.tree.cache_store().contains_file("/d/keep/dirty"));
        assert!(t.tree.cache_store().contains_dir("/d/keep"));
        assert!(t.tree.cache_store().contains_dir("/d"));
        // the fully clean sibling branch is gone
        assert!(!t.tree.cache_store().contains_dir("/d/drop"));
        // the pending upload for the survivor is still queued
        t.expect_queued("/d/keep/dirty", QueueMethod::Put);
    }

    #[tokio::test]
    async fn test_delete_local_directory_preserves_root() {
        let t = TestTree::new();
        t.cached_file("/f", b"x").await;
        t.tree.delete_local_directory("/").unwrap();
        assert!(!t.tree.cache_store().contains_file("/f"));
        assert!(t.tree.cache_store().contains_dir("/"));
    }

    #[tokio::test]
    async fn test_write_and_truncate_update_local_content() {
        let t = TestTree::new();
        t.cached_file("/f", b"0123456789").await;
        t.tree.write("/f", 4, b"XY").await.unwrap();
        assert_eq!(t.tree.read("/f").await.unwrap(), b"0123XY6789");
        let meta = t.tree.set_length("/f", 6).await.unwrap();
        assert_eq!(meta.size, 6);
        assert_eq!(t.tree.read("/f").await.unwrap(), b"0123XY");
        t.expect_queued("/f", QueueMethod::Put);
    }

    #[tokio::test]
    async fn test_write_to_uncached_remote_file_fetches_first() {
        let t = TestTree::new();
        t.remote.add_file("/f", b"abcdef");
        t.tree.write("/f", 3, b"XYZ").await.unwrap();
        assert_eq!(t.tree.read("/f").await.unwrap(), b"abcXYZ");
        assert_eq!(t.remote.calls().fetch, 1);
    }

    #[tokio::test]
    async fn test_write_to_missing_temporary_is_not_found() {
        let t = TestTree::new();
        let err = t.tree.write("/.tmp", 0, b"x").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_custom_temp_marker() {
        let t = TestTree::with_config(Arc::new(MemoryRemote::new()), |c| c.temp_marker = '~');
        t.tree.create_file("/~scratch").await.unwrap();
        assert!(t.tree.queue().is_empty());
        // dot names are ordinary paths under this marker
        t.tree.create_file("/.profile").await.unwrap();
        t.expect_queued("/.profile", QueueMethod::Put);
    }

    #[tokio::test]
    async fn test_externally_stamped_mtime_marks_file_dirty() {
        let t = TestTree::new();
        t.cached_file("/f", b"x").await;
        assert!(t.tree.can_delete("/f").allowed);
        let (synced, _) = t.tree.file_times("/f");
        t.tree
            .cache_store()
            .set_last_modified("/f", synced.unwrap() + 1)
            .unwrap();
        assert!(!t.tree.can_delete("/f").allowed);
    }

    #[tokio::test]
    async fn test_file_times_track_sync_and_edit() {
        let t = TestTree::new();
        t.cached_file("/f", b"x").await;
        let (synced, modified) = t.tree.file_times("/f");
        assert!(synced.is_some());
        assert!(modified.is_some());

        t.tree.write("/f", 0, b"y").await.unwrap();
        let (synced, modified) = t.tree.file_times("/f");
        assert!(modified.unwrap() > synced.unwrap());

        t.tree.mark_synced("/f").unwrap();
        let (synced, modified) = t.tree.file_times("/f");
        assert!(synced.unwrap() >= modified.unwrap());
    }
}
