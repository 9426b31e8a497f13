//! Data models and structures
//!
//! Defines the job payload that travels through the queue, the request
//! record that tracks it, and the deterministic naming of result images.

use crate::status::Status;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Compression,
    Conversion,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Compression => "compression",
            Operation::Conversion => "conversion",
        }
    }

    /// Name of the image this operation produces for `source_name`.
    pub fn result_name(&self, source_name: &str) -> Result<String> {
        match self {
            Operation::Compression => Ok(format!("cmp-{}", source_name)),
            Operation::Conversion => {
                let target = TargetFormat::for_source(source_name)?;
                Ok(format!("cnv-{}", target.rename(source_name)))
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "compression" => Ok(Operation::Compression),
            "conversion" => Ok(Operation::Conversion),
            other => Err(Error::InvalidJob(format!("unknown operation '{}'", other))),
        }
    }
}

/// Output format of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    Png,
    Jpeg,
}

impl TargetFormat {
    /// jpeg and jpg become png, png becomes jpeg.
    pub fn for_source(source_name: &str) -> Result<Self> {
        match extension(source_name).as_deref() {
            Some("jpeg") | Some("jpg") => Ok(TargetFormat::Png),
            Some("png") => Ok(TargetFormat::Jpeg),
            Some(other) => Err(Error::UnsupportedFormat(other.to_string())),
            None => Err(Error::UnsupportedFormat(format!(
                "'{}' has no extension",
                source_name
            ))),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::Png => "png",
            TargetFormat::Jpeg => "jpeg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            TargetFormat::Png => "image/png",
            TargetFormat::Jpeg => "image/jpeg",
        }
    }

    /// Swap the extension of `name` for this format's.
    pub fn rename(&self, name: &str) -> String {
        let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);
        format!("{}.{}", stem, self.extension())
    }
}

fn extension(name: &str) -> Option<String> {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

/// Name and storage location of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub location: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
        }
    }
}

/// Payload published to the queue for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub operation: Operation,
    pub request_id: Uuid,
    pub source_name: String,
    pub source_location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
}

impl JobMessage {
    /// Decode and validate a delivery body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let job: JobMessage = serde_json::from_slice(body)?;
        job.validate()?;
        Ok(job)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_name.trim().is_empty() {
            return Err(Error::InvalidJob("empty source name".to_string()));
        }
        match (self.operation, self.width) {
            (Operation::Compression, None) => Err(Error::InvalidJob(
                "compression requires a target width".to_string(),
            )),
            (Operation::Compression, Some(0)) => {
                Err(Error::InvalidJob("target width must be positive".to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn result_name(&self) -> Result<String> {
        self.operation.result_name(&self.source_name)
    }
}

/// Everything needed to create a request and its job.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub operation: Operation,
    pub source: ImageRef,
    pub width: Option<u32>,
}

impl NewRequest {
    pub fn job_message(&self) -> JobMessage {
        JobMessage {
            operation: self.operation,
            request_id: self.id,
            source_name: self.source.name.clone(),
            source_location: self.source.location.clone(),
            width: self.width,
        }
    }

    /// Build the Queued record for this request.
    pub fn into_record(self, queued_at: DateTime<Utc>) -> Result<RequestRecord> {
        let job = self.job_message();
        job.validate()?;
        let result_name = job.result_name()?;

        Ok(RequestRecord {
            id: self.id,
            user_id: self.user_id,
            operation: self.operation,
            source: self.source,
            width: self.width,
            result_name,
            status: Status::Queued,
            time_queued: queued_at,
            time_started: None,
            time_completed: None,
            result: None,
            failure: None,
        })
    }
}

/// Persisted lifecycle of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub operation: Operation,
    pub source: ImageRef,
    pub width: Option<u32>,
    /// Name the result will be stored under once the job is done.
    pub result_name: String,
    pub status: Status,
    pub time_queued: DateTime<Utc>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_completed: Option<DateTime<Utc>>,
    pub result: Option<ImageRef>,
    /// Last permanent failure reported by a worker. Does not affect status.
    pub failure: Option<String>,
}
