//! Request/reply dispatch by method name.
//!
//! Every request carries a `request_string` naming the operation; the
//! remaining fields are read as that operation needs them. Failures never
//! escape as errors: they become `{success: false, err_msg}` replies.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use visor_core::{Annotation, Error, RankingPage, Result};

use crate::manager::QueryManager;

/// Incoming request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcRequest {
    pub request_string: String,
    pub id: Option<String>,
    pub tag: Option<String>,
    pub train_image_urls: Option<Vec<String>>,
    pub retrieve_page: Option<usize>,
    pub filepath: Option<String>,
    pub paths: Option<Vec<String>>,
}

impl RpcRequest {
    pub fn new(request_string: &str) -> Self {
        Self {
            request_string: request_string.to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.train_image_urls = Some(urls);
        self
    }

    pub fn with_page(mut self, page: usize) -> Self {
        self.retrieve_page = Some(page);
        self
    }

    pub fn with_filepath(mut self, filepath: &str) -> Self {
        self.filepath = Some(filepath.to_string());
        self
    }

    pub fn with_paths(mut self, paths: Vec<String>) -> Self {
        self.paths = Some(paths);
        self
    }

    fn query_id(&self) -> Result<&str> {
        self.id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InvalidRequest(format!("{} requires an id", self.request_string)))
    }

    fn page(&self) -> usize {
        self.retrieve_page.unwrap_or(1)
    }

    fn file(&self) -> Result<PathBuf> {
        self.filepath
            .as_deref()
            .filter(|f| !f.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| {
                Error::InvalidRequest(format!("{} requires a filepath", self.request_string))
            })
    }

    fn urls(&self) -> &[String] {
        self.train_image_urls.as_deref().unwrap_or(&[])
    }

    /// Local paths: `paths`, falling back to `train_image_urls`.
    fn local_paths(&self) -> &[String] {
        match self.paths.as_deref() {
            Some(paths) if !paths.is_empty() => paths,
            _ => self.urls(),
        }
    }
}

/// One annotation line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationEntry {
    pub path: String,
    pub anno: i32,
}

impl From<Annotation> for AnnotationEntry {
    fn from(a: Annotation) -> Self {
        Self {
            path: a.path,
            anno: a.anno.as_i32(),
        }
    }
}

/// Outgoing reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub success: bool,
    #[serde(default)]
    pub err_msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranking: Option<RankingPage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<AnnotationEntry>>,
}

impl RpcReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(err_msg: impl Into<String>) -> Self {
        Self {
            success: false,
            err_msg: err_msg.into(),
            ..Default::default()
        }
    }

    fn with_id(mut self, id: String) -> Self {
        self.id = Some(id);
        self
    }

    fn with_ranking(mut self, page: RankingPage) -> Self {
        self.ranking = Some(page);
        self
    }
}

/// Run one request against the manager. Blocks for the `*_and_wait` and
/// composite operations.
pub fn dispatch(manager: &QueryManager, request: &RpcRequest) -> RpcReply {
    debug!(request = %request.request_string, query_id = ?request.id, "Dispatching request");
    match handle(manager, request) {
        Ok(reply) => reply,
        Err(e) => {
            if e.is_request_error() {
                debug!(request = %request.request_string, error = %e, "Request rejected");
            } else {
                warn!(request = %request.request_string, error = %e, "Request failed");
            }
            RpcReply::failure(e.to_string())
        }
    }
}

fn handle(manager: &QueryManager, req: &RpcRequest) -> Result<RpcReply> {
    let reply = match req.request_string.as_str() {
        "start_query" => RpcReply::ok().with_id(manager.start_query(req.tag.as_deref())),
        "set_tag" => {
            let tag = req
                .tag
                .as_deref()
                .ok_or_else(|| Error::InvalidRequest("set_tag requires a tag".to_string()))?;
            manager.set_tag(req.query_id()?, tag)?;
            RpcReply::ok()
        }
        "add_trs" => {
            manager.add_trs(req.query_id()?, req.urls())?;
            RpcReply::ok()
        }
        "add_trs_from_file" => {
            manager.add_trs_from_file(req.query_id()?, req.local_paths(), false)?;
            RpcReply::ok()
        }
        "add_trs_from_file_and_wait" => {
            manager.add_trs_from_file(req.query_id()?, req.local_paths(), true)?;
            RpcReply::ok()
        }
        "train" => {
            manager.train(req.query_id()?, false)?;
            RpcReply::ok()
        }
        "train_and_wait" => {
            manager.train(req.query_id()?, true)?;
            RpcReply::ok()
        }
        "rank" => {
            manager.rank(req.query_id()?, false)?;
            RpcReply::ok()
        }
        "rank_and_wait" => {
            manager.rank(req.query_id()?, true)?;
            RpcReply::ok()
        }
        "get_ranking" => RpcReply::ok().with_ranking(manager.get_ranking(req.query_id()?, req.page())?),
        "train_rank_get_ranking" => {
            RpcReply::ok().with_ranking(manager.train_rank_get_ranking(req.query_id()?, req.page())?)
        }
        "free_query" => {
            manager.free_query(req.query_id()?)?;
            RpcReply::ok()
        }
        "save_annotations" => {
            manager.save_annotations(req.query_id()?, &req.file()?)?;
            RpcReply::ok()
        }
        "get_annotations" => {
            let annotations = manager.get_annotations(&req.file()?)?;
            RpcReply {
                annotations: Some(annotations.into_iter().map(AnnotationEntry::from).collect()),
                ..RpcReply::ok()
            }
        }
        "save_classifier" => {
            manager.save_classifier(req.query_id()?, &req.file()?)?;
            RpcReply::ok()
        }
        "load_classifier" => {
            manager.load_classifier(req.query_id()?, &req.file()?)?;
            RpcReply::ok()
        }
        "add_dset_images_to_index" => {
            manager.add_dset_images_to_index(req.local_paths())?;
            RpcReply::ok()
        }
        other => {
            return Err(Error::InvalidRequest(format!(
                "unrecognised request string: {}",
                other
            )))
        }
    };
    Ok(reply)
}
