impl Reconciler {
    /// Phase A: list the workspace root, then fan out one listing per
    /// folder, level by level, building the path-keyed snapshot.
    async fn snapshot(&self, ctx: &WorkspaceContext) -> Result<RemoteTreeMap, ReconcileError> {
        self.guard(ctx)?;
        let workspace_id = ctx.workspace_id();
        let mut map = RemoteTreeMap::new();

        let mut level: Vec<(String, i64)> = Vec::new();
        for entry in self.client.list_root(workspace_id).await? {
            let rel = entry.name.clone();
            if entry.kind == EntryKind::Folder {
                level.push((rel.clone(), entry.id));
            }
            map.insert(&rel, entry);
        }

        while !level.is_empty() {
            self.guard(ctx)?;
            let listings = join_all(level.drain(..).map(|(prefix, folder_id)| {
                let client = self.client.clone();
                async move { (prefix, client.list_folder(workspace_id, folder_id).await) }
            }))
            .await;

            let mut next = Vec::new();
            for (prefix, result) in listings {
                for entry in result? {
                    let rel = format!("{prefix}/{}", entry.name);
                    if entry.kind == EntryKind::Folder {
                        next.push((rel.clone(), entry.id));
                    }
                    map.insert(&rel, entry);
                }
            }
            level = next;
        }
        Ok(map)
    }

    /// Breadth-first local walk below the sync root, dirs depth-ascending.
    /// Unreadable children are logged and skipped; the pass continues.
    async fn collect_local_tree(&self) -> Result<(Vec<LocalDir>, Vec<LocalFile>), ReconcileError> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let mut queue: VecDeque<(PathBuf, String, usize)> = VecDeque::new();
        queue.push_back((self.sync_root.clone(), String::new(), 0));

        while let Some((dir_abs, rel_prefix, depth)) = queue.pop_front() {
            let mut entries = match tokio::fs::read_dir(&dir_abs).await {
                Ok(entries) => entries,
                Err(err) if depth > 0 => {
                    eprintln!("[cirrusd] skipping unreadable dir {}: {err}", dir_abs.display());
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            loop {
                let dirent = match entries.next_entry().await {
                    Ok(Some(dirent)) => dirent,
                    Ok(None) => break,
                    Err(err) => {
                        eprintln!("[cirrusd] skipping unreadable entry in {}: {err}", dir_abs.display());
                        break;
                    }
                };
                let name = dirent.file_name().to_string_lossy().into_owned();
                if is_noise_name(&name) {
                    continue;
                }
                let rel = if rel_prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{rel_prefix}/{name}")
                };
                let Ok(file_type) = dirent.file_type().await else {
                    continue;
                };
                if file_type.is_symlink() {
                    continue;
                }
                if file_type.is_dir() {
                    if self.excluded_dirs.contains(&name) {
                        continue;
                    }
                    dirs.push(LocalDir {
                        rel: rel.clone(),
                        abs: dirent.path(),
                        depth: depth + 1,
                    });
                    queue.push_back((dirent.path(), rel, depth + 1));
                } else {
                    let Ok(meta) = dirent.metadata().await else {
                        continue;
                    };
                    files.push(LocalFile {
                        rel,
                        abs: dirent.path(),
                        size: meta.len(),
                        mtime: mtime_unix(&meta),
                    });
                }
            }
        }
        dirs.sort_by_key(|dir| dir.depth);
        Ok((dirs, files))
    }

    /// Phases B and D. The initial walk (`newer_only == false`) creates
    /// missing folders depth-ascending and uploads local-only files; the
    /// second walk uploads only the files flagged local-newer, replacing
    /// their remote entries.
    async fn upload_walk(
        &self,
        ctx: &WorkspaceContext,
        map: &mut RemoteTreeMap,
        in_flight: &InFlightPaths,
        local_newer: &mut HashSet<String>,
        summary: &mut PassSummary,
        newer_only: bool,
    ) -> Result<(), ReconcileError> {
        let workspace_id = ctx.workspace_id();
        let (dirs, files) = self.collect_local_tree().await?;

        if !newer_only {
            for dir in &dirs {
                if map.contains(&dir.rel) {
                    continue;
                }
                self.guard(ctx)?;
                let parent_id = match map.resolve_parent(&dir.rel) {
                    ParentRef::Root => None,
                    ParentRef::Folder(id) => Some(id),
                    ParentRef::Unresolved => {
                        summary.deferred += 1;
                        continue;
                    }
                };
                let entry = match self
                    .client
                    .create_folder(workspace_id, basename(&dir.rel), parent_id)
                    .await
                {
                    Ok(entry) => entry,
                    Err(err)
                        if matches!(
                            err.classification(),
                            Some(cirrus_core::ApiErrorClass::Auth)
                        ) =>
                    {
                        return Err(err.into());
                    }
                    Err(err) => {
                        // Descendants stay deferred rather than landing at
                        // root under an unresolved parent.
                        eprintln!("[cirrusd] folder create failed for {}: {err}", dir.rel);
                        summary.deferred += 1;
                        continue;
                    }
                };
                self.store.upsert(&record_for(&entry, &dir.abs)?).await?;
                // Visible immediately so descendants resolve against it.
                map.insert(&dir.rel, entry);
                summary.folders_created += 1;
            }
        }

        let mut pending: Vec<(LocalFile, Option<i64>, crate::sync::guard::FlightTicket)> =
            Vec::new();
        for file in files {
            let key = normalize_key(&file.rel);
            if newer_only && !local_newer.contains(&key) {
                continue;
            }

            if let Some(remote) = map.get(&file.rel) {
                if remote.id == PLACEHOLDER_ID {
                    continue;
                }
                if newer_only {
                    // Flagged as local-newer: replace the remote entry.
                    self.guard(ctx)?;
                    if self.echo.is_recent(&file.abs) {
                        local_newer.remove(&key);
                        continue;
                    }
                    let Some(ticket) = in_flight.reserve(&key) else {
                        continue;
                    };
                    let old = remote.clone();
                    self.client.delete(workspace_id, old.id).await?;
                    self.store.delete(old.id).await?;
                    match self
                        .pipeline
                        .upload(workspace_id, &file.abs, old.parent_id)
                        .await
                    {
                        Ok(entry) => {
                            self.store.upsert(&record_for(&entry, &file.abs)?).await?;
                            self.echo.mark(&file.abs);
                            map.insert(&file.rel, entry);
                            summary.uploads += 1;
                            local_newer.remove(&key);
                        }
                        Err(err) => {
                            map.remove(&file.rel);
                            eprintln!(
                                "[cirrusd] upload failed for {}: {err}",
                                file.abs.display()
                            );
                        }
                    }
                    drop(ticket);
                } else if remote.size == Some(file.size) {
                    // Same path, same size: the same file. Record and skip.
                    let entry = remote.clone();
                    self.store.upsert(&record_for(&entry, &file.abs)?).await?;
                } else {
                    // Same path, different content: last writer wins, local
                    // winning inside the tolerance band. Remote-newer is
                    // Phase C's to download.
                    let remote_ts = parse_updated_at(remote.updated_at.as_deref())?.unwrap_or(0);
                    if !remote_is_newer(remote_ts, file.mtime) {
                        local_newer.insert(key);
                    }
                }
                continue;
            }

            if newer_only {
                continue;
            }
            // Local-only file. Never re-upload our own downloads.
            if self.echo.is_recent(&file.abs) {
                continue;
            }
            let parent_id = match map.resolve_parent(&file.rel) {
                ParentRef::Root => None,
                ParentRef::Folder(id) => Some(id),
                ParentRef::Unresolved => {
                    summary.deferred += 1;
                    continue;
                }
            };
            let Some(ticket) = in_flight.reserve(&key) else {
                continue;
            };
            map.insert(&file.rel, placeholder_file(workspace_id, &file, parent_id));
            pending.push((file, parent_id, ticket));
        }

        if pending.is_empty() {
            return Ok(());
        }
        self.guard(ctx)?;

        let total = pending.len();
        let results = join_all(pending.into_iter().map(|(file, parent_id, ticket)| {
            let pipeline = Arc::clone(&self.pipeline);
            async move {
                let result = pipeline.upload(workspace_id, &file.abs, parent_id).await;
                (file, result, ticket)
            }
        }))
        .await;

        for (index, (file, result, _ticket)) in results.into_iter().enumerate() {
            match result {
                Ok(entry) => {
                    self.store.upsert(&record_for(&entry, &file.abs)?).await?;
                    self.echo.mark(&file.abs);
                    map.insert(&file.rel, entry);
                    summary.uploads += 1;
                }
                Err(err) => {
                    map.remove(&file.rel);
                    eprintln!("[cirrusd] upload failed for {}: {err}", file.abs.display());
                }
            }
            let stage = if newer_only {
                PassStage::UploadNewer
            } else {
                PassStage::UploadNew
            };
            self.emit_progress(stage, (((index + 1) * 100) / total) as u8, &file.rel);
        }
        Ok(())
    }

    /// Phase C: materialize remote folders locally, download remote-only
    /// and remote-newer files, and flag local-newer files for Phase D.
    async fn download_remote(
        &self,
        ctx: &WorkspaceContext,
        map: &RemoteTreeMap,
        local_newer: &mut HashSet<String>,
        summary: &mut PassSummary,
    ) -> Result<(), ReconcileError> {
        let workspace_id = ctx.workspace_id();

        let mut folders: Vec<_> = map
            .iter()
            .filter(|slot| {
                slot.entry.kind == EntryKind::Folder && slot.entry.id != PLACEHOLDER_ID
            })
            .collect();
        folders.sort_by_key(|slot| slot.path.len());
        for slot in folders {
            self.guard(ctx)?;
            let abs = local_path_for(&self.sync_root, &slot.path)?;
            tokio::fs::create_dir_all(&abs).await?;
            self.store.upsert(&record_for(&slot.entry, &abs)?).await?;
        }

        let mut to_download: Vec<(String, RemoteEntry, PathBuf)> = Vec::new();
        for slot in map.files() {
            if slot.entry.id == PLACEHOLDER_ID {
                continue;
            }
            let abs = local_path_for(&self.sync_root, &slot.path)?;
            let Some(dest_dir) = abs.parent().map(PathBuf::from) else {
                continue;
            };
            match tokio::fs::metadata(&abs).await {
                Err(_) => {
                    // Not present locally at all.
                    to_download.push((slot.path.clone(), slot.entry.clone(), dest_dir));
                }
                Ok(meta) if meta.is_dir() => continue,
                Ok(meta) => {
                    let remote_ts =
                        parse_updated_at(slot.entry.updated_at.as_deref())?.unwrap_or(0);
                    let local_ts = mtime_unix(&meta);
                    if slot.entry.size == Some(meta.len()) {
                        if remote_is_newer(remote_ts, local_ts) {
                            to_download.push((slot.path.clone(), slot.entry.clone(), dest_dir));
                        } else if local_is_newer(local_ts, remote_ts) {
                            local_newer.insert(normalize_key(&slot.path));
                        }
                        // Inside the band with equal sizes: already in sync.
                    } else if remote_is_newer(remote_ts, local_ts) {
                        to_download.push((slot.path.clone(), slot.entry.clone(), dest_dir));
                    }
                    // Local-newer size mismatches were flagged in Phase B.
                }
            }
        }

        if to_download.is_empty() {
            return Ok(());
        }
        self.guard(ctx)?;

        let total = to_download.len();
        let results = join_all(to_download.into_iter().map(|(rel, entry, dest_dir)| {
            let pipeline = Arc::clone(&self.pipeline);
            async move {
                let result = pipeline.download(workspace_id, &entry, &dest_dir).await;
                (rel, entry, result)
            }
        }))
        .await;

        for (index, (rel, entry, result)) in results.into_iter().enumerate() {
            match result {
                Ok(written) => {
                    // Stamp the remote timestamp onto the file so the next
                    // pass sees it as in sync rather than locally newer.
                    if let Some(ts) = parse_updated_at(entry.updated_at.as_deref())? {
                        let _ = set_file_mtime(&written, ts);
                    }
                    self.store.upsert(&record_for(&entry, &written)?).await?;
                    self.echo.mark(&written);
                    summary.downloads += 1;
                }
                Err(err) => {
                    eprintln!("[cirrusd] download failed for {rel}: {err}");
                }
            }
            self.emit_progress(PassStage::Download, (((index + 1) * 100) / total) as u8, &rel);
        }
        Ok(())
    }
}

fn placeholder_file(workspace_id: i64, file: &LocalFile, parent_id: Option<i64>) -> RemoteEntry {
    RemoteEntry {
        id: PLACEHOLDER_ID,
        name: basename(&file.rel).to_string(),
        kind: EntryKind::File,
        parent_id,
        size: Some(file.size),
        hash: None,
        updated_at: None,
        workspace_id,
    }
}
