#![allow(dead_code)]

use std::{ops::Deref, sync::Arc};

use casequeue::{config::Config, service::Service, transport::Transport};
use chrono::{DateTime, SubsecRound, Utc};
use tempfile::TempDir;

pub struct TmpService {
    svc: Service,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

impl TmpService {
    pub fn into_inner(self) -> (Service, TempDir) {
        (self.svc, self.tmpdir)
    }
}

/// The current time at the precision the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub fn config_in(path: &TempDir) -> Config {
    Config {
        db_path: Some(path.path().join("casequeue.db").to_string_lossy().to_string()),
        ..Default::default()
    }
}

pub async fn setup() -> TmpService {
    setup_with(|config| config, None).await
}

pub async fn setup_with(
    configure: impl FnOnce(Config) -> Config,
    transport: Option<Arc<dyn Transport>>,
) -> TmpService {
    let path = tempfile::tempdir().unwrap();
    let config = configure(config_in(&path));

    TmpService {
        svc: Service::connect_with()
            .config(config)
            .maybe_transport(transport)
            .call()
            .await
            .unwrap(),
        tmpdir: path,
    }
}
