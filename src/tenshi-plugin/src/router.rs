//! Adapter-side routing for adapters that resolve streams interactively.
//!
//! Some adapters need to show their own UI before they can answer, so the
//! stream request cannot be answered from inside the call. A [`RequestRouter`]
//! parks the reply sink under the request's unique name, hands the request
//! to an [`InteractiveLauncher`], and completes the parked sink when the
//! interactive side reports back through [`RequestRouter::notify_result`].
//!
//! Only one request per unique name can be parked. A second request for the
//! same name replaces the first, and the first caller never hears back, so
//! callers should not issue overlapping requests for one unique name.

use crate::transport::{RemoteAdapter, RemoteError, ReplySink, StreamReply, StreamRequest};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const PARAM_ANIME_ID: &str = "animeId";
pub const PARAM_EN_TITLE: &str = "titleEN";
pub const PARAM_JP_TITLE: &str = "titleJP";
pub const PARAM_EPISODE: &str = "episode";
pub const PARAM_PERSISTENT_STORAGE: &str = "persistentStorage";
pub const PARAM_UNIQUE_NAME: &str = "uniqueName";

/// Unique names and display names an interactive adapter serves.
pub trait AdapterCatalog: Send + Sync {
    fn unique_names(&self) -> Vec<String>;

    fn display_name(&self, unique_name: &str) -> String;
}

/// Starts the interactive part of an adapter (usually a UI window).
pub trait InteractiveLauncher: Send + Sync {
    fn launch(&self, request: InteractiveRequest) -> Result<(), RemoteError>;
}

/// Parameters handed to the interactive side of an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractiveRequest {
    pub unique_name: String,
    pub anime_id: u32,
    pub en_title: String,
    pub jp_title: String,
    pub episode: u32,
    pub persistent_storage: String,
}

impl From<StreamRequest> for InteractiveRequest {
    fn from(req: StreamRequest) -> Self {
        Self {
            unique_name: req.unique_name,
            anime_id: req.anime_id,
            en_title: req.en_title,
            jp_title: req.jp_title,
            episode: req.episode,
            persistent_storage: req.persistent_storage,
        }
    }
}

impl InteractiveRequest {
    /// Flatten into string parameters, e.g. for a launched process.
    pub fn to_params(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (PARAM_UNIQUE_NAME.to_string(), self.unique_name.clone()),
            (PARAM_ANIME_ID.to_string(), self.anime_id.to_string()),
            (PARAM_EN_TITLE.to_string(), self.en_title.clone()),
            (PARAM_JP_TITLE.to_string(), self.jp_title.clone()),
            (PARAM_EPISODE.to_string(), self.episode.to_string()),
            (
                PARAM_PERSISTENT_STORAGE.to_string(),
                self.persistent_storage.clone(),
            ),
        ])
    }

    /// Rebuild a request from string parameters.
    ///
    /// Returns `None` without a unique name; the interactive side should not
    /// start in that case. Missing storage reads as empty, missing or bad
    /// numbers as 0.
    pub fn from_params(params: &BTreeMap<String, String>) -> Option<Self> {
        let unique_name = params.get(PARAM_UNIQUE_NAME)?.clone();
        if unique_name.is_empty() {
            return None;
        }
        let number = |key: &str| {
            params
                .get(key)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or_default()
        };
        let text = |key: &str| params.get(key).cloned().unwrap_or_default();

        Some(Self {
            anime_id: number(PARAM_ANIME_ID),
            en_title: text(PARAM_EN_TITLE),
            jp_title: text(PARAM_JP_TITLE),
            episode: number(PARAM_EPISODE),
            persistent_storage: text(PARAM_PERSISTENT_STORAGE),
            unique_name,
        })
    }

    /// Report `stream_url`, handing back the storage this request came with.
    pub fn complete<C, L>(&self, router: &RequestRouter<C, L>, stream_url: Option<String>) -> bool
    where
        C: AdapterCatalog,
        L: InteractiveLauncher,
    {
        self.complete_with_storage(router, stream_url, self.persistent_storage.clone())
    }

    /// Report `stream_url` together with updated storage.
    pub fn complete_with_storage<C, L>(
        &self,
        router: &RequestRouter<C, L>,
        stream_url: Option<String>,
        persistent_storage: String,
    ) -> bool
    where
        C: AdapterCatalog,
        L: InteractiveLauncher,
    {
        router.notify_result(&self.unique_name, stream_url, Some(persistent_storage))
    }
}

/// A [`RemoteAdapter`] whose stream answers come from an interactive flow.
pub struct RequestRouter<C, L> {
    catalog: C,
    launcher: L,
    pending: Mutex<HashMap<String, ReplySink>>,
}

impl<C, L> std::fmt::Debug for RequestRouter<C, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("pending", &self.pending().len())
            .finish_non_exhaustive()
    }
}

impl<C, L> RequestRouter<C, L> {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, ReplySink>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C, L> RequestRouter<C, L>
where
    C: AdapterCatalog,
    L: InteractiveLauncher,
{
    pub fn new(catalog: C, launcher: L) -> Self {
        Self {
            catalog,
            launcher,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn is_pending(&self, unique_name: &str) -> bool {
        self.pending().contains_key(unique_name)
    }

    /// Complete the request parked under `unique_name`.
    ///
    /// Returns false, dropping the result, when nothing is parked.
    pub fn notify_result(
        &self,
        unique_name: &str,
        stream_url: Option<String>,
        persistent_storage: Option<String>,
    ) -> bool {
        let Some(sink) = self.pending().remove(unique_name) else {
            tracing::debug!(
                unique_name = %unique_name,
                "no pending stream request; dropping result"
            );
            return false;
        };
        sink.send(StreamReply::new(
            stream_url,
            Some(persistent_storage.unwrap_or_default()),
        ));
        true
    }
}

impl<C, L> RemoteAdapter for RequestRouter<C, L>
where
    C: AdapterCatalog,
    L: InteractiveLauncher,
{
    fn unique_names(&self) -> Result<Vec<String>, RemoteError> {
        Ok(self.catalog.unique_names())
    }

    fn display_name(&self, unique_name: &str) -> Result<String, RemoteError> {
        Ok(self.catalog.display_name(unique_name))
    }

    fn request_stream_uri(
        &self,
        request: StreamRequest,
        reply: ReplySink,
    ) -> Result<(), RemoteError> {
        let unique_name = request.unique_name.clone();
        if let Some(previous) = self.pending().insert(unique_name.clone(), reply) {
            tracing::warn!(
                unique_name = %unique_name,
                "stream request replaced an unanswered one; the earlier caller will not be answered"
            );
            previous.abandon();
        }

        if let Err(err) = self.launcher.launch(request.into()) {
            let parked = self.pending().remove(&unique_name);
            // Dropping the sink answers the caller with nothing.
            drop(parked);
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReplyOutcome;
    use std::sync::Arc;

    struct Catalog;

    impl AdapterCatalog for Catalog {
        fn unique_names(&self) -> Vec<String> {
            vec!["webview".into()]
        }

        fn display_name(&self, _unique_name: &str) -> String {
            "Web View".into()
        }
    }

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<InteractiveRequest>>,
        fail: bool,
    }

    impl InteractiveLauncher for RecordingLauncher {
        fn launch(&self, request: InteractiveRequest) -> Result<(), RemoteError> {
            if self.fail {
                return Err(RemoteError::Launch("no display".into()));
            }
            self.launched.lock().unwrap().push(request);
            Ok(())
        }
    }

    fn request(storage: &str) -> StreamRequest {
        StreamRequest {
            unique_name: "webview".into(),
            anime_id: 5114,
            en_title: "Fullmetal Alchemist: Brotherhood".into(),
            jp_title: "鋼の錬金術師".into(),
            episode: 3,
            persistent_storage: storage.into(),
        }
    }

    fn recorder() -> (ReplySink, Arc<Mutex<Vec<ReplyOutcome>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        (
            ReplySink::new(move |r| sink_seen.lock().unwrap().push(r)),
            seen,
        )
    }

    #[test]
    fn result_reaches_parked_sink() {
        let router = RequestRouter::new(Catalog, RecordingLauncher::default());
        let (sink, seen) = recorder();
        router.request_stream_uri(request("s1"), sink).unwrap();
        assert!(router.is_pending("webview"));

        let launched = router.launcher().launched.lock().unwrap()[0].clone();
        assert!(launched.complete(&router, Some("https://cdn/ep3.mp4".into())));

        assert!(!router.is_pending("webview"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ReplyOutcome::Replied(StreamReply::new(
                Some("https://cdn/ep3.mp4".into()),
                Some("s1".into())
            ))]
        );
    }

    #[test]
    fn unknown_name_result_is_dropped() {
        let router = RequestRouter::new(Catalog, RecordingLauncher::default());
        assert!(!router.notify_result("webview", Some("x".into()), None));
    }

    #[test]
    fn second_request_clobbers_first() {
        let router = RequestRouter::new(Catalog, RecordingLauncher::default());
        let (first, first_seen) = recorder();
        let (second, second_seen) = recorder();
        router.request_stream_uri(request(""), first).unwrap();
        router.request_stream_uri(request(""), second).unwrap();

        router.notify_result("webview", None, None);
        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(
            *second_seen.lock().unwrap(),
            vec![ReplyOutcome::Replied(StreamReply::new(None, Some(String::new())))]
        );
    }

    #[test]
    fn failed_launch_answers_with_nothing() {
        let launcher = RecordingLauncher {
            fail: true,
            ..Default::default()
        };
        let router = RequestRouter::new(Catalog, launcher);
        let (sink, seen) = recorder();
        assert!(router.request_stream_uri(request(""), sink).is_err());
        assert!(!router.is_pending("webview"));
        assert_eq!(*seen.lock().unwrap(), vec![ReplyOutcome::Lost]);
    }

    #[test]
    fn params_round_trip_requires_unique_name() {
        let req = InteractiveRequest::from(request("abc"));
        assert_eq!(InteractiveRequest::from_params(&req.to_params()), Some(req));

        let mut params = BTreeMap::new();
        params.insert(PARAM_EPISODE.to_string(), "4".to_string());
        assert_eq!(InteractiveRequest::from_params(&params), None);

        params.insert(PARAM_UNIQUE_NAME.to_string(), "webview".to_string());
        let parsed = InteractiveRequest::from_params(&params).unwrap();
        assert_eq!(parsed.episode, 4);
        assert_eq!(parsed.persistent_storage, "");
    }
}
