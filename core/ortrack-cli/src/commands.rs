use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ortrack_core::{
    CancelToken, ContinuousOptions, EngineConfig, FileScanner, OutboundOptions, Result,
    TrackError, TrackingEngine, VerifyOptions,
};
use ortrack_store::{load_seed, Db};

use crate::Commands;

pub struct Context {
    pub config: EngineConfig,
    pub db_path: Option<PathBuf>,
}

impl Context {
    fn open_db(&self) -> Result<Arc<Db>> {
        let path = match &self.db_path {
            Some(path) => path.clone(),
            None => self.config.storage.resolved_database_path()?,
        };
        Ok(Arc::new(Db::new(path)?))
    }

    fn engine(&self, scans: Vec<PathBuf>) -> Result<TrackingEngine> {
        let db = self.open_db()?;
        Ok(TrackingEngine::new(
            db.clone(),
            db,
            Arc::new(FileScanner::sequence(scans)),
            self.config.clone(),
        ))
    }
}

pub fn run(context: &Context, command: Commands) -> Result<Value> {
    match command {
        Commands::Import { seed } => {
            let seed = load_seed(&seed)?;
            let summary = context.open_db()?.import_seed(&seed)?;
            to_value(&summary)
        }
        Commands::Verify {
            session_id,
            scans,
            cumulative,
            operator,
        } => {
            let options = VerifyOptions {
                cumulative,
                operator,
                scan_duration: None,
            };
            to_value(&context.engine(scans)?.verify(session_id, &options)?)
        }
        Commands::Watch {
            session_id,
            scans,
            fresh,
            operator,
            max_secs,
            interval_secs,
        } => {
            let options = ContinuousOptions {
                cumulative: !fresh,
                operator,
                max_duration: max_secs.map(Duration::from_secs),
                scan_duration: None,
                cycle_interval: interval_secs.map(Duration::from_secs),
            };
            let report = context.engine(scans)?.start_continuous_verification(
                session_id,
                &options,
                &CancelToken::new(),
            )?;
            to_value(&report)
        }
        Commands::Outbound {
            session_id,
            scans,
            operator,
        } => {
            let options = OutboundOptions {
                operator,
                scan_duration: None,
            };
            to_value(&context.engine(scans)?.check_outbound(session_id, &options)?)
        }
        Commands::Status { session_id } => {
            to_value(&context.engine(Vec::new())?.verification_status(session_id)?)
        }
        Commands::OutboundStatus { session_id } => {
            to_value(&context.engine(Vec::new())?.outbound_status(session_id)?)
        }
        Commands::Advance { session_id, state } => {
            let session = context.engine(Vec::new())?.advance_session(session_id, state)?;
            Ok(serde_json::json!({
                "operation_session_id": session.id,
                "state": session.state,
            }))
        }
        Commands::Invalidate {
            session_id,
            operator,
        } => {
            let engine = context.engine(Vec::new())?;
            to_value(&engine.invalidate_verification(session_id, operator.as_deref())?)
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|source| TrackError::Json {
        context: "encoding response".to_string(),
        source,
    })
}
