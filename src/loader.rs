//! Folder loading: fetch every text or PDF document directly inside a folder.
//!
//! Two sources are provided: Google Drive folders addressed by their Drive id, and
//! local directories under a root path addressed by their directory name. Loading is
//! non-recursive in both cases.

use crate::document::{self, Document, DocumentKind};
use crate::error::{RagError, RagResult};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

const DEFAULT_DRIVE_API_URL: &str = "https://www.googleapis.com/drive/v3";
const GOOGLE_DOC_MIME: &str = "application/vnd.google-apps.document";
const PDF_MIME: &str = "application/pdf";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// A place documents can be loaded from, keyed by folder id
#[async_trait]
pub trait FolderSource: Send + Sync {
    /// Load all documents in the folder.
    ///
    /// Fails with `NotFound` when the folder does not exist and `Access` for any
    /// other retrieval failure.
    async fn load(&self, folder_id: &str) -> RagResult<Vec<Document>>;
}

/// Loads documents from sub-directories of a local root
pub struct LocalFolderSource {
    root: PathBuf,
}

impl LocalFolderSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFolderSource { root: root.into() }
    }

    fn folder_path(&self, folder_id: &str) -> RagResult<PathBuf> {
        // Folder ids name a direct child of the root and nothing else
        if folder_id.is_empty()
            || folder_id.contains(['/', '\\'])
            || folder_id == "."
            || folder_id == ".."
        {
            return Err(RagError::NotFound(folder_id.to_string()));
        }
        Ok(self.root.join(folder_id))
    }
}

#[async_trait]
impl FolderSource for LocalFolderSource {
    async fn load(&self, folder_id: &str) -> RagResult<Vec<Document>> {
        let dir = self.folder_path(folder_id)?;
        let folder_id = folder_id.to_string();

        tokio::task::spawn_blocking(move || load_local_dir(dir, &folder_id))
            .await
            .map_err(|e| RagError::Access(format!("Folder load task failed: {}", e)))?
    }
}

fn load_local_dir(dir: PathBuf, folder_id: &str) -> RagResult<Vec<Document>> {
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(RagError::NotFound(folder_id.to_string()))
        }
        Err(e) => return Err(RagError::Access(format!("{}: {}", dir.display(), e))),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RagError::Access(e.to_string()))?;
        let path = entry.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    // read_dir order is platform dependent
    paths.sort();

    let mut documents = Vec::new();
    for path in paths {
        let mime_type = mime_guess::from_path(&path).first_or_octet_stream();
        if DocumentKind::from_mime(mime_type.essence_str()).is_none() {
            debug!("Skipping unsupported file {}", path.display());
            continue;
        }

        let mut loaded = Document::from_file(&path, folder_id)
            .map_err(|e| RagError::Access(format!("{:#}", e)))?;
        documents.append(&mut loaded);
    }

    info!("Loaded {} documents from {}", documents.len(), dir.display());
    Ok(documents)
}

/// Credentials for the Google Drive API
#[derive(Debug, Clone)]
pub enum DriveAuth {
    /// OAuth access token, sent as a bearer token
    AccessToken(String),
    /// API key, valid for publicly shared folders only
    ApiKey(String),
}

/// Configuration for the Google Drive folder source
#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub api_url: String,
    pub auth: DriveAuth,
}

impl DriveConfig {
    /// Read Drive credentials from the environment, `None` when none are configured
    pub fn from_env() -> Option<Self> {
        let auth = env::var("DRIVE_ACCESS_TOKEN")
            .map(DriveAuth::AccessToken)
            .or_else(|_| env::var("DRIVE_API_KEY").map(DriveAuth::ApiKey))
            .ok()?;
        let api_url =
            env::var("DRIVE_API_URL").unwrap_or_else(|_| DEFAULT_DRIVE_API_URL.to_string());

        Some(DriveConfig { api_url, auth })
    }
}

/// Loads Google Docs and PDFs from a Google Drive folder
pub struct DriveFolderSource {
    config: DriveConfig,
    client: reqwest::Client,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
}

/// Metadata fetched when checking the folder itself
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct FolderMeta {
    mime_type: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

impl DriveFolderSource {
    pub fn new(config: DriveConfig) -> Self {
        DriveFolderSource {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.config.auth {
            DriveAuth::AccessToken(token) => request.bearer_auth(token),
            DriveAuth::ApiKey(key) => request.query(&[("key", key)]),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> RagResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| RagError::Access(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RagError::Access(format!(
                "Drive request failed: {} {}",
                status, error_text
            )));
        }

        Ok(response)
    }

    async fn check_folder(&self, folder_id: &str) -> RagResult<()> {
        let url = format!("{}/files/{}", self.config.api_url, folder_id);
        let request = self.get(&url).query(&[("fields", "id,mimeType")]);
        let response = request
            .send()
            .await
            .map_err(|e| RagError::Access(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RagError::NotFound(folder_id.to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(RagError::Access(format!(
                "Drive request failed: {} {}",
                status, error_text
            )));
        }

        let folder: FolderMeta = response
            .json()
            .await
            .map_err(|e| RagError::Access(format!("Malformed Drive response: {}", e)))?;
        if folder.mime_type != FOLDER_MIME {
            return Err(RagError::NotFound(folder_id.to_string()));
        }

        Ok(())
    }

    async fn list_files(&self, folder_id: &str) -> RagResult<Vec<DriveFile>> {
        let url = format!("{}/files", self.config.api_url);
        let query = format!("'{}' in parents and trashed = false", folder_id);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.get(&url).query(&[
                ("q", query.as_str()),
                ("fields", "nextPageToken,files(id,name,mimeType)"),
                ("pageSize", "1000"),
            ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let list: FileList = self
                .send(request)
                .await?
                .json()
                .await
                .map_err(|e| RagError::Access(format!("Malformed Drive response: {}", e)))?;
            files.extend(list.files);

            match list.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(files)
    }

    async fn load_file(&self, file: &DriveFile, folder_id: &str) -> RagResult<Vec<Document>> {
        match file.mime_type.as_str() {
            GOOGLE_DOC_MIME => {
                let url = format!("{}/files/{}/export", self.config.api_url, file.id);
                let request = self.get(&url).query(&[("mimeType", "text/plain")]);
                let content = self
                    .send(request)
                    .await?
                    .text()
                    .await
                    .map_err(|e| RagError::Access(e.to_string()))?;
                Ok(vec![Document::new(content, &file.name, None, folder_id)])
            }
            PDF_MIME => {
                let url = format!("{}/files/{}", self.config.api_url, file.id);
                let request = self.get(&url).query(&[("alt", "media")]);
                let bytes = self
                    .send(request)
                    .await?
                    .bytes()
                    .await
                    .map_err(|e| RagError::Access(e.to_string()))?;
                let pages = tokio::task::spawn_blocking(move || document::extract_pdf_pages(&bytes))
                    .await
                    .map_err(|e| RagError::Access(format!("PDF extraction task failed: {}", e)))?
                    .map_err(|e| {
                        RagError::Access(format!("Failed to extract text from {}: {}", file.name, e))
                    })?;
                Ok(document::paginate(pages, &file.name, folder_id))
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl FolderSource for DriveFolderSource {
    async fn load(&self, folder_id: &str) -> RagResult<Vec<Document>> {
        self.check_folder(folder_id).await?;

        let files = self.list_files(folder_id).await?;
        info!("Folder {} lists {} files", folder_id, files.len());

        let mut documents = Vec::new();
        for file in &files {
            if file.mime_type != GOOGLE_DOC_MIME && file.mime_type != PDF_MIME {
                debug!("Skipping {} ({})", file.name, file.mime_type);
                continue;
            }
            let mut loaded = self.load_file(file, folder_id).await?;
            if loaded.is_empty() {
                warn!("No text extracted from {}", file.name);
            }
            documents.append(&mut loaded);
        }

        Ok(documents)
    }
}
