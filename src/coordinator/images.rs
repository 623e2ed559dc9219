//! Images, builds and uploads

use std::collections::BTreeMap;
use std::time::Duration;

use super::{decode, most_recent, required_id, Coordinator};
use crate::error::{Error, Result};
use crate::lock::LockHandle;
use crate::model::{to_json, BuildState, ImageBuild, ImageUpload, Stateful, UploadState};
use crate::paths;
use crate::store::CreateMode;

/// Uploads of one provider grouped by image, then build number
pub type ProviderUploads = BTreeMap<String, BTreeMap<String, Vec<ImageUpload>>>;

impl Coordinator {
    // ========== Locks ==========

    /// Serialises builders of one image
    pub async fn image_build_lock(
        &self,
        image: &str,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<LockHandle> {
        self.lock_path(&paths::image_build_lock(image), true, blocking, timeout)
            .await
    }

    /// Guards a single build during cleanup
    pub async fn image_build_number_lock(
        &self,
        image: &str,
        build_number: &str,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<LockHandle> {
        self.lock_path(
            &paths::image_build_number_lock(image, build_number),
            false,
            blocking,
            timeout,
        )
        .await
    }

    /// Serialises uploaders of one build to one provider
    pub async fn image_upload_lock(
        &self,
        image: &str,
        build_number: &str,
        provider: &str,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<LockHandle> {
        self.lock_path(
            &paths::image_upload_lock(image, build_number, provider),
            true,
            blocking,
            timeout,
        )
        .await
    }

    /// Guards a single stored upload
    pub async fn image_upload_number_lock(
        &self,
        upload: &ImageUpload,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<LockHandle> {
        let id = required_id("image upload", upload.id())?;
        let path = paths::image_upload_number_lock(
            upload.image_name(),
            upload.build_id(),
            upload.provider_name(),
            &id,
        );
        self.lock_path(&path, false, blocking, timeout).await
    }

    // ========== Images ==========

    pub async fn image_names(&self) -> Result<Vec<String>> {
        let mut names = self.children(paths::IMAGE_ROOT).await?;
        names.sort();
        Ok(names)
    }

    /// Whether building of `image` is paused
    pub async fn get_image_paused(&self, image: &str) -> Result<bool> {
        Ok(self.store()?.exists(&paths::image_pause(image)).await?.is_some())
    }

    pub async fn set_image_paused(&self, image: &str, paused: bool) -> Result<()> {
        let path = paths::image_pause(image);
        if !paused {
            return self.remove(&path, false).await;
        }
        match self
            .store()?
            .create(&path, Vec::new(), CreateMode::PERSISTENT, true)
            .await
        {
            Ok(_) | Err(Error::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn has_build_request(&self, image: &str) -> Result<bool> {
        Ok(self
            .store()?
            .exists(&paths::image_build_request(image))
            .await?
            .is_some())
    }

    /// Ask builders for a fresh build of `image`
    pub async fn submit_build_request(&self, image: &str) -> Result<()> {
        self.store()?
            .ensure_path(&paths::image_build_request(image))
            .await
    }

    pub async fn remove_build_request(&self, image: &str) -> Result<()> {
        self.remove(&paths::image_build_request(image), false).await
    }

    // ========== Builds ==========

    /// Build numbers of an image, lock entry excluded
    pub async fn build_numbers(&self, image: &str) -> Result<Vec<String>> {
        self.entries(&paths::image_builds(image)).await
    }

    /// Providers a build has been uploaded to
    pub async fn build_providers(&self, image: &str, build_number: &str) -> Result<Vec<String>> {
        let mut providers = self
            .children(&paths::image_providers(image, build_number))
            .await?;
        providers.sort();
        Ok(providers)
    }

    pub async fn get_build(&self, image: &str, build_number: &str) -> Result<Option<ImageBuild>> {
        let path = paths::image_build(image, build_number);
        let Some((data, stat)) = self.read(&path).await? else {
            return Ok(None);
        };
        Ok(decode::<ImageBuild>(&path, &data).map(|mut build| {
            build.set_id(build_number);
            build.set_stat(stat);
            build
        }))
    }

    /// Builds of an image, optionally only those in one of `states`
    pub async fn get_builds(
        &self,
        image: &str,
        states: Option<&[BuildState]>,
    ) -> Result<Vec<ImageBuild>> {
        let mut builds = Vec::new();
        for build_number in self.build_numbers(image).await? {
            let Some(build) = self.get_build(image, &build_number).await? else {
                continue;
            };
            let wanted = match states {
                Some(states) => build.state().is_some_and(|s| states.contains(&s)),
                None => true,
            };
            if wanted {
                builds.push(build);
            }
        }
        Ok(builds)
    }

    /// Newest builds of an image first, at most `count`
    pub async fn most_recent_builds(
        &self,
        count: Option<usize>,
        image: &str,
        state: Option<BuildState>,
    ) -> Result<Vec<ImageBuild>> {
        let states = state.map(|s| [s]);
        let builds = self.get_builds(image, states.as_ref().map(|s| &s[..])).await?;
        Ok(most_recent(builds, count))
    }

    /// Store a build, allocating the next build number when none is given
    pub async fn store_build(
        &self,
        image: &str,
        build: &ImageBuild,
        build_number: Option<&str>,
    ) -> Result<String> {
        let store = self.store()?;
        let data = to_json(build)?;
        match build_number {
            Some(number) => {
                store.set(&paths::image_build(image, number), data, None).await?;
                Ok(number.to_string())
            }
            None => {
                let path = store
                    .create(
                        &format!("{}/", paths::image_builds(image)),
                        data,
                        CreateMode::PERSISTENT_SEQUENTIAL,
                        true,
                    )
                    .await?;
                Ok(paths::basename(&path).to_string())
            }
        }
    }

    /// Remove a build unless uploads of it remain. Returns false when it
    /// was kept.
    pub async fn delete_build(&self, image: &str, build_number: &str) -> Result<bool> {
        for provider in self.build_providers(image, build_number).await? {
            if !self
                .image_upload_numbers(image, build_number, &provider)
                .await?
                .is_empty()
            {
                tracing::debug!(
                    "Build {}-{} still has uploads to {}",
                    image,
                    build_number,
                    provider
                );
                return Ok(false);
            }
        }
        self.remove(&paths::image_build(image, build_number), true)
            .await?;
        Ok(true)
    }

    // ========== Uploads ==========

    /// Upload numbers of a build on one provider, lock entry excluded
    pub async fn image_upload_numbers(
        &self,
        image: &str,
        build_number: &str,
        provider: &str,
    ) -> Result<Vec<String>> {
        self.entries(&paths::image_uploads(image, build_number, provider))
            .await
    }

    pub async fn get_image_upload(
        &self,
        image: &str,
        build_number: &str,
        provider: &str,
        upload_number: &str,
    ) -> Result<Option<ImageUpload>> {
        let path = paths::image_upload(image, build_number, provider, upload_number);
        let Some((data, stat)) = self.read(&path).await? else {
            return Ok(None);
        };
        Ok(decode::<ImageUpload>(&path, &data).map(|upload| {
            let mut upload = upload.with_identity(build_number, provider, image, upload_number);
            upload.set_stat(stat);
            upload
        }))
    }

    /// Uploads of a build on one provider, optionally only in `states`
    pub async fn get_uploads(
        &self,
        image: &str,
        build_number: &str,
        provider: &str,
        states: Option<&[UploadState]>,
    ) -> Result<Vec<ImageUpload>> {
        let mut uploads = Vec::new();
        for upload_number in self
            .image_upload_numbers(image, build_number, provider)
            .await?
        {
            let Some(upload) = self
                .get_image_upload(image, build_number, provider, &upload_number)
                .await?
            else {
                continue;
            };
            let wanted = match states {
                Some(states) => upload.state().is_some_and(|s| states.contains(&s)),
                None => true,
            };
            if wanted {
                uploads.push(upload);
            }
        }
        Ok(uploads)
    }

    /// Newest uploads of one build to one provider first, at most `count`
    pub async fn most_recent_build_image_uploads(
        &self,
        count: Option<usize>,
        image: &str,
        build_number: &str,
        provider: &str,
        state: Option<UploadState>,
    ) -> Result<Vec<ImageUpload>> {
        let states = state.map(|s| [s]);
        let uploads = self
            .get_uploads(image, build_number, provider, states.as_ref().map(|s| &s[..]))
            .await?;
        Ok(most_recent(uploads, count))
    }

    /// Newest upload of an image to a provider across every build
    pub async fn most_recent_image_upload(
        &self,
        image: &str,
        provider: &str,
        state: Option<UploadState>,
    ) -> Result<Option<ImageUpload>> {
        let mut newest: Option<ImageUpload> = None;
        for build_number in self.build_numbers(image).await? {
            let candidate = self
                .most_recent_build_image_uploads(Some(1), image, &build_number, provider, state)
                .await?
                .into_iter()
                .next();
            let Some(candidate) = candidate else { continue };
            let newer = match &newest {
                Some(current) => {
                    candidate.state_time().unwrap_or(f64::MIN)
                        > current.state_time().unwrap_or(f64::MIN)
                }
                None => true,
            };
            if newer {
                newest = Some(candidate);
            }
        }
        Ok(newest)
    }

    /// Store an upload of an existing build, allocating the next upload
    /// number when none is given
    pub async fn store_image_upload(
        &self,
        image: &str,
        build_number: &str,
        provider: &str,
        upload: &ImageUpload,
        upload_number: Option<&str>,
    ) -> Result<String> {
        let store = self.store()?;
        let build_path = paths::image_build(image, build_number);
        if store.exists(&build_path).await?.is_none() {
            return Err(Error::MissingParent(build_path));
        }

        let data = to_json(upload)?;
        match upload_number {
            Some(number) => {
                store
                    .set(
                        &paths::image_upload(image, build_number, provider, number),
                        data,
                        None,
                    )
                    .await?;
                Ok(number.to_string())
            }
            None => {
                let path = store
                    .create(
                        &format!("{}/", paths::image_uploads(image, build_number, provider)),
                        data,
                        CreateMode::PERSISTENT_SEQUENTIAL,
                        true,
                    )
                    .await?;
                Ok(paths::basename(&path).to_string())
            }
        }
    }

    pub async fn delete_upload(
        &self,
        image: &str,
        build_number: &str,
        provider: &str,
        upload_number: &str,
    ) -> Result<()> {
        self.remove(
            &paths::image_upload(image, build_number, provider, upload_number),
            true,
        )
        .await
    }

    // ========== Provider cleanup ==========

    /// Build numbers per image that have a subtree for `provider`
    pub async fn provider_builds(&self, provider: &str) -> Result<BTreeMap<String, Vec<String>>> {
        let mut found: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for image in self.image_names().await? {
            for build_number in self.build_numbers(&image).await? {
                let providers = self.build_providers(&image, &build_number).await?;
                if providers.iter().any(|p| p == provider) {
                    found.entry(image.clone()).or_default().push(build_number);
                }
            }
        }
        Ok(found)
    }

    /// Every upload stored for `provider`
    pub async fn provider_uploads(&self, provider: &str) -> Result<ProviderUploads> {
        let mut found = ProviderUploads::new();
        for image in self.image_names().await? {
            for build_number in self.build_numbers(&image).await? {
                let uploads = self
                    .get_uploads(&image, &build_number, provider, None)
                    .await?;
                if !uploads.is_empty() {
                    found
                        .entry(image.clone())
                        .or_default()
                        .insert(build_number, uploads);
                }
            }
        }
        Ok(found)
    }

    /// Drop the `provider` subtree of each listed build
    pub async fn remove_provider_builds(
        &self,
        provider: &str,
        builds: &BTreeMap<String, Vec<String>>,
    ) -> Result<()> {
        for (image, build_numbers) in builds {
            for build_number in build_numbers {
                self.remove(&paths::image_provider(image, build_number, provider), true)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::testing::{coordinator, coordinator_on};
    use crate::store::MemoryStore;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn build(state: BuildState, state_time: f64) -> ImageBuild {
        let mut build = ImageBuild::new("");
        build.builder = Some("nb01.example.com".into());
        build.set_formats(vec!["raw".into(), "qcow2".into()]);
        build.set_state(state);
        build.set_state_time(state_time);
        build
    }

    fn upload(state: UploadState, state_time: f64) -> ImageUpload {
        let mut upload = ImageUpload::new("", "", "", "");
        upload.format = Some("qcow2".into());
        upload.external_id = Some("ami-0001".into());
        upload.set_state(state);
        upload.set_state_time(state_time);
        upload
    }

    #[tokio::test]
    async fn test_store_and_get_build() {
        let (coord, _store) = coordinator();
        let first = coord
            .store_build("ubuntu", &build(BuildState::Building, 10.0), None)
            .await
            .unwrap();
        assert_eq!(first, "0000000001");

        let mut ready = build(BuildState::Ready, 20.0);
        ready.builder_id = Some("builder-a".into());
        assert_eq!(
            coord.store_build("ubuntu", &ready, Some(&first)).await.unwrap(),
            first
        );

        let stored = coord.get_build("ubuntu", &first).await.unwrap().unwrap();
        assert_eq!(stored.id(), Some(first.as_str()));
        assert_eq!(stored.state(), Some(BuildState::Ready));
        assert_eq!(stored.formats(), vec!["qcow2".to_string(), "raw".to_string()]);
        assert_eq!(stored.stat().unwrap().version, 1);
        assert!(coord.get_build("ubuntu", "0000000042").await.unwrap().is_none());
        assert!(coord.get_build("debian", &first).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_most_recent_builds() {
        let (coord, _store) = coordinator();
        for (time, state) in [
            (10.0, BuildState::Ready),
            (30.0, BuildState::Ready),
            (20.0, BuildState::Ready),
            (5.0, BuildState::Failed),
        ] {
            coord.store_build("ubuntu", &build(state, time), None).await.unwrap();
        }
        // The build lock must not show up as a build
        let _lock = coord.image_build_lock("ubuntu", true, None).await.unwrap();
        assert_eq!(coord.build_numbers("ubuntu").await.unwrap().len(), 4);

        let recent = coord
            .most_recent_builds(Some(2), "ubuntu", Some(BuildState::Ready))
            .await
            .unwrap();
        let times: Vec<f64> = recent.iter().filter_map(|b| b.state_time()).collect();
        assert_eq!(times, vec![30.0, 20.0]);

        let all = coord.most_recent_builds(None, "ubuntu", None).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[3].state(), Some(BuildState::Failed));

        let failed = coord
            .get_builds("ubuntu", Some(&[BuildState::Failed, BuildState::Deleting]))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert!(coord
            .most_recent_builds(Some(3), "centos", None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_build_and_upload_numbers() {
        let (first, store) = coordinator();
        let second = coordinator_on(Arc::new(MemoryStore::with_tree(store.tree().clone())), false);
        let sessions = [Arc::new(first), Arc::new(second)];

        let builds = (0..16).map(|i| {
            let coord = sessions[i % 2].clone();
            tokio::spawn(async move {
                let builder = format!("nb{:02}", i);
                let mut data = build(BuildState::Building, i as f64);
                data.builder = Some(builder.clone());
                (coord.store_build("ubuntu", &data, None).await.unwrap(), builder)
            })
        });
        let builds: Vec<(String, String)> = futures::future::join_all(builds)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();
        let numbers: HashSet<&String> = builds.iter().map(|(number, _)| number).collect();
        assert_eq!(numbers.len(), 16);
        for (number, builder) in &builds {
            let stored = sessions[0].get_build("ubuntu", number).await.unwrap().unwrap();
            assert_eq!(stored.builder.as_ref(), Some(builder));
        }

        let build_number = builds[0].0.clone();
        let uploads = (0..16).map(|i| {
            let coord = sessions[i % 2].clone();
            let build_number = build_number.clone();
            tokio::spawn(async move {
                let external_id = format!("ami-{:04}", i);
                let mut data = upload(UploadState::Uploading, i as f64);
                data.external_id = Some(external_id.clone());
                let number = coord
                    .store_image_upload("ubuntu", &build_number, "aws", &data, None)
                    .await
                    .unwrap();
                (number, external_id)
            })
        });
        let uploads: Vec<(String, String)> = futures::future::join_all(uploads)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();
        let numbers: HashSet<&String> = uploads.iter().map(|(number, _)| number).collect();
        assert_eq!(numbers.len(), 16);
        for (number, external_id) in &uploads {
            let stored = sessions[1]
                .get_image_upload("ubuntu", &build_number, "aws", number)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.external_id.as_ref(), Some(external_id));
        }
    }

    #[tokio::test]
    async fn test_upload_needs_existing_build() {
        let (coord, _store) = coordinator();
        let err = coord
            .store_image_upload("ubuntu", "0000000001", "aws", &upload(UploadState::Uploading, 1.0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingParent(p) if p == "/nodepool/images/ubuntu/builds/0000000001"));

        let build_number = coord
            .store_build("ubuntu", &build(BuildState::Ready, 1.0), None)
            .await
            .unwrap();
        let upload_number = coord
            .store_image_upload("ubuntu", &build_number, "aws", &upload(UploadState::Uploading, 2.0), None)
            .await
            .unwrap();
        assert_eq!(upload_number, "0000000001");

        let stored = coord
            .get_image_upload("ubuntu", &build_number, "aws", &upload_number)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.image_name(), "ubuntu");
        assert_eq!(stored.build_id(), build_number);
        assert_eq!(stored.provider_name(), "aws");
        assert_eq!(stored.id(), Some(upload_number.as_str()));
        assert_eq!(stored.external_id.as_deref(), Some("ami-0001"));
        assert_eq!(
            coord.build_providers("ubuntu", &build_number).await.unwrap(),
            vec!["aws".to_string()]
        );

        let handle = coord
            .image_upload_number_lock(&stored, false, None)
            .await
            .unwrap();
        assert_eq!(
            coord
                .image_upload_numbers("ubuntu", &build_number, "aws")
                .await
                .unwrap(),
            vec![upload_number.clone()]
        );
        handle.release().await.unwrap();

        let unstored = ImageUpload::new(&build_number, "aws", "ubuntu", "");
        assert!(matches!(
            coord.image_upload_number_lock(&unstored, false, None).await,
            Err(Error::MissingId("image upload"))
        ));
    }

    #[tokio::test]
    async fn test_delete_build_waits_for_uploads() {
        let (coord, _store) = coordinator();
        let build_number = coord
            .store_build("ubuntu", &build(BuildState::Ready, 1.0), None)
            .await
            .unwrap();
        let upload_number = coord
            .store_image_upload("ubuntu", &build_number, "aws", &upload(UploadState::Ready, 2.0), None)
            .await
            .unwrap();

        assert!(!coord.delete_build("ubuntu", &build_number).await.unwrap());
        assert!(coord.get_build("ubuntu", &build_number).await.unwrap().is_some());

        coord
            .delete_upload("ubuntu", &build_number, "aws", &upload_number)
            .await
            .unwrap();
        assert!(coord.delete_build("ubuntu", &build_number).await.unwrap());
        assert!(coord.get_build("ubuntu", &build_number).await.unwrap().is_none());
        // Already gone
        assert!(coord.delete_build("ubuntu", &build_number).await.unwrap());
    }

    #[tokio::test]
    async fn test_most_recent_image_upload_across_builds() {
        let (coord, _store) = coordinator();
        let old = coord
            .store_build("ubuntu", &build(BuildState::Ready, 1.0), None)
            .await
            .unwrap();
        let new = coord
            .store_build("ubuntu", &build(BuildState::Ready, 2.0), None)
            .await
            .unwrap();
        for (build_number, state, time) in [
            (&old, UploadState::Ready, 10.0),
            (&old, UploadState::Ready, 40.0),
            (&new, UploadState::Ready, 30.0),
            (&new, UploadState::Failed, 50.0),
        ] {
            coord
                .store_image_upload("ubuntu", build_number, "aws", &upload(state, time), None)
                .await
                .unwrap();
        }

        let newest = coord
            .most_recent_image_upload("ubuntu", "aws", Some(UploadState::Ready))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(newest.state_time(), Some(40.0));
        assert_eq!(newest.build_id(), old);

        let any = coord
            .most_recent_image_upload("ubuntu", "aws", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(any.state(), Some(UploadState::Failed));
        assert!(coord
            .most_recent_image_upload("ubuntu", "gcp", None)
            .await
            .unwrap()
            .is_none());

        let per_build = coord
            .most_recent_build_image_uploads(Some(5), "ubuntu", &new, "aws", None)
            .await
            .unwrap();
        let times: Vec<f64> = per_build.iter().filter_map(|u| u.state_time()).collect();
        assert_eq!(times, vec![50.0, 30.0]);
    }

    #[tokio::test]
    async fn test_pause_and_build_requests() {
        let (coord, _store) = coordinator();
        assert!(!coord.get_image_paused("ubuntu").await.unwrap());
        coord.set_image_paused("ubuntu", true).await.unwrap();
        coord.set_image_paused("ubuntu", true).await.unwrap();
        assert!(coord.get_image_paused("ubuntu").await.unwrap());
        coord.set_image_paused("ubuntu", false).await.unwrap();
        coord.set_image_paused("ubuntu", false).await.unwrap();
        assert!(!coord.get_image_paused("ubuntu").await.unwrap());

        assert!(!coord.has_build_request("ubuntu").await.unwrap());
        coord.submit_build_request("ubuntu").await.unwrap();
        coord.submit_build_request("ubuntu").await.unwrap();
        assert!(coord.has_build_request("ubuntu").await.unwrap());
        coord.remove_build_request("ubuntu").await.unwrap();
        assert!(!coord.has_build_request("ubuntu").await.unwrap());
        coord.remove_build_request("ubuntu").await.unwrap();

        assert_eq!(coord.image_names().await.unwrap(), vec!["ubuntu".to_string()]);
    }

    #[tokio::test]
    async fn test_build_lock_contention() {
        let (coord, store) = coordinator();
        let other = coordinator_on(Arc::new(MemoryStore::with_tree(store.tree().clone())), false);

        let held = coord.image_build_lock("ubuntu", false, None).await.unwrap();
        assert!(matches!(
            other.image_build_lock("ubuntu", false, None).await,
            Err(Error::LockUnavailable(_))
        ));
        assert!(matches!(
            other
                .image_build_lock("ubuntu", true, Some(Duration::from_millis(50)))
                .await,
            Err(Error::Timeout(_))
        ));
        held.release().await.unwrap();
        let taken = other.image_build_lock("ubuntu", false, None).await.unwrap();
        assert!(taken.is_held());

        // Per-build locks need the build to exist
        let err = coord
            .image_build_number_lock("ubuntu", "0000000007", false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTargetMissing(_)));
    }

    #[tokio::test]
    async fn test_provider_cleanup() {
        let (coord, _store) = coordinator();
        let ubuntu = coord
            .store_build("ubuntu", &build(BuildState::Ready, 1.0), None)
            .await
            .unwrap();
        let debian = coord
            .store_build("debian", &build(BuildState::Ready, 1.0), None)
            .await
            .unwrap();
        for (image, build_number, provider) in [
            ("ubuntu", &ubuntu, "aws"),
            ("ubuntu", &ubuntu, "gcp"),
            ("debian", &debian, "aws"),
        ] {
            coord
                .store_image_upload(image, build_number, provider, &upload(UploadState::Ready, 2.0), None)
                .await
                .unwrap();
        }

        let builds = coord.provider_builds("aws").await.unwrap();
        assert_eq!(builds.len(), 2);
        assert_eq!(builds["ubuntu"], vec![ubuntu.clone()]);
        let uploads = coord.provider_uploads("aws").await.unwrap();
        assert_eq!(uploads["debian"][&debian].len(), 1);
        assert_eq!(uploads["debian"][&debian][0].provider_name(), "aws");

        coord.remove_provider_builds("aws", &builds).await.unwrap();
        assert!(coord.provider_builds("aws").await.unwrap().is_empty());
        assert!(coord.provider_uploads("aws").await.unwrap().is_empty());
        assert_eq!(
            coord.build_providers("ubuntu", &ubuntu).await.unwrap(),
            vec!["gcp".to_string()]
        );
    }
}
