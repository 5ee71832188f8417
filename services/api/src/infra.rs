use assess_core::assessment::catalog::STANDARD_CATALOG;
use assess_core::assessment::{
    Advance, AssessmentEngine, CatalogLoader, EngineConfig, EngineError, HistoryEntry,
    InMemoryProgressStore,
};
use assess_core::error::AppError;
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

type SessionEngine = AssessmentEngine<InMemoryProgressStore>;

/// Holds one engine per participant session. Progress itself lives in the
/// shared store, so dropping a session entry loses nothing that was saved.
pub(crate) struct SessionService {
    loader: CatalogLoader,
    store: InMemoryProgressStore,
    config: EngineConfig,
    sessions: Mutex<HashMap<String, SessionEngine>>,
}

impl SessionService {
    pub(crate) fn new(config: EngineConfig) -> Self {
        Self {
            loader: CatalogLoader::new(),
            store: InMemoryProgressStore::new(),
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn build_engine(&self, session: &str, catalog: Option<&str>) -> Result<SessionEngine, AppError> {
        let reference = catalog.unwrap_or(STANDARD_CATALOG);
        let catalog = self.loader.load(reference)?;
        Ok(AssessmentEngine::new(
            catalog,
            self.config.clone(),
            self.store.clone(),
            session,
        ))
    }

    /// Begin a fresh run for the session, replacing any existing engine.
    pub(crate) fn start(
        &self,
        session: &str,
        catalog: Option<&str>,
    ) -> Result<Advance, AppError> {
        let mut engine = self.build_engine(session, catalog)?;
        let advance = engine.start()?;
        self.sessions
            .lock()
            .expect("session mutex poisoned")
            .insert(session.to_string(), engine);
        Ok(advance)
    }

    /// Resume the session's saved run, or start one when nothing is saved.
    pub(crate) fn resume(
        &self,
        session: &str,
        catalog: Option<&str>,
    ) -> Result<Advance, AppError> {
        let mut guard = self.sessions.lock().expect("session mutex poisoned");
        if let Some(engine) = guard.get_mut(session) {
            return Ok(engine.resume()?);
        }
        drop(guard);
        let mut engine = self.build_engine(session, catalog)?;
        let advance = engine.resume()?;
        self.sessions
            .lock()
            .expect("session mutex poisoned")
            .insert(session.to_string(), engine);
        Ok(advance)
    }

    /// Run `f` against the session's engine. Unknown sessions surface as
    /// "no assessment in progress".
    pub(crate) fn with<T>(
        &self,
        session: &str,
        f: impl FnOnce(&mut SessionEngine) -> Result<T, EngineError>,
    ) -> Result<T, AppError> {
        let mut guard = self.sessions.lock().expect("session mutex poisoned");
        let engine = guard.get_mut(session).ok_or(EngineError::NotActive)?;
        Ok(f(engine)?)
    }

    pub(crate) fn history(
        &self,
        session: &str,
        catalog: Option<&str>,
    ) -> Result<Vec<HistoryEntry>, AppError> {
        let guard = self.sessions.lock().expect("session mutex poisoned");
        if let Some(engine) = guard.get(session) {
            return Ok(engine.history()?);
        }
        drop(guard);
        // Completed runs outlive their session entry.
        let engine = self.build_engine(session, catalog)?;
        Ok(engine.history()?)
    }
}
