//! Insert error taxonomy and failure tallies
//!
//! Every terminal outcome of a segment or of a whole insert is expressed as
//! an [`InsertError`]. Partial failures across many blocks or segments are
//! accumulated in a [`FailureCodeTracker`] and folded into a single error
//! with [`InsertError::from_tracker`].

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::fieldset::FieldSet;

/// Category of an insert failure
///
/// The numeric codes are part of the persisted progress format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InsertErrorMode {
    /// The target URI was invalid
    InvalidUri,
    /// Reading or writing temporary payload storage failed
    BucketError,
    /// An internal invariant was violated
    InternalError,
    /// Downstream nodes were overloaded
    RejectedOverload,
    /// The insert could not be routed
    RouteNotFound,
    /// Some blocks failed fatally
    FatalErrorsInBlocks,
    /// Some blocks ran out of retries
    TooManyRetriesInBlocks,
    /// The insert could not be routed, even on retry
    RouteReallyNotFound,
    /// A different block already lives under the key
    Collision,
    /// The insert was cancelled
    Cancelled,
    /// Meta-strings are not supported on this key type
    MetaStringsNotSupported,
    /// A binary blob was malformed
    BinaryBlobFormatError,
}

impl InsertErrorMode {
    const ALL: [InsertErrorMode; 12] = [
        InsertErrorMode::InvalidUri,
        InsertErrorMode::BucketError,
        InsertErrorMode::InternalError,
        InsertErrorMode::RejectedOverload,
        InsertErrorMode::RouteNotFound,
        InsertErrorMode::FatalErrorsInBlocks,
        InsertErrorMode::TooManyRetriesInBlocks,
        InsertErrorMode::RouteReallyNotFound,
        InsertErrorMode::Collision,
        InsertErrorMode::Cancelled,
        InsertErrorMode::MetaStringsNotSupported,
        InsertErrorMode::BinaryBlobFormatError,
    ];

    /// Numeric code used in progress records
    pub fn code(self) -> u8 {
        match self {
            InsertErrorMode::InvalidUri => 1,
            InsertErrorMode::BucketError => 2,
            InsertErrorMode::InternalError => 3,
            InsertErrorMode::RejectedOverload => 4,
            InsertErrorMode::RouteNotFound => 5,
            InsertErrorMode::FatalErrorsInBlocks => 6,
            InsertErrorMode::TooManyRetriesInBlocks => 7,
            InsertErrorMode::RouteReallyNotFound => 8,
            InsertErrorMode::Collision => 9,
            InsertErrorMode::Cancelled => 10,
            InsertErrorMode::MetaStringsNotSupported => 11,
            InsertErrorMode::BinaryBlobFormatError => 12,
        }
    }

    /// Look up a mode by its numeric code
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.code() == code)
    }

    /// Whether a failure of this kind dooms the whole insert
    pub fn is_fatal(self) -> bool {
        match self {
            InsertErrorMode::InvalidUri
            | InsertErrorMode::FatalErrorsInBlocks
            | InsertErrorMode::Collision
            | InsertErrorMode::Cancelled
            | InsertErrorMode::MetaStringsNotSupported
            | InsertErrorMode::BinaryBlobFormatError => true,
            InsertErrorMode::BucketError
            | InsertErrorMode::InternalError
            | InsertErrorMode::RejectedOverload
            | InsertErrorMode::RouteNotFound
            | InsertErrorMode::TooManyRetriesInBlocks
            | InsertErrorMode::RouteReallyNotFound => false,
        }
    }

    fn description(self) -> &'static str {
        match self {
            InsertErrorMode::InvalidUri => "Invalid URI",
            InsertErrorMode::BucketError => "Temporary storage error",
            InsertErrorMode::InternalError => "Internal error",
            InsertErrorMode::RejectedOverload => "Insert rejected by overloaded nodes",
            InsertErrorMode::RouteNotFound => "Could not route the insert",
            InsertErrorMode::FatalErrorsInBlocks => "Some blocks failed fatally",
            InsertErrorMode::TooManyRetriesInBlocks => "Some blocks ran out of retries",
            InsertErrorMode::RouteReallyNotFound => "Insert could not leave this node",
            InsertErrorMode::Collision => "A different block already exists under this key",
            InsertErrorMode::Cancelled => "Cancelled",
            InsertErrorMode::MetaStringsNotSupported => "Meta-strings not supported",
            InsertErrorMode::BinaryBlobFormatError => "Binary blob format error",
        }
    }
}

impl fmt::Display for InsertErrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Multiset of failure categories
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureCodeTracker {
    counts: BTreeMap<InsertErrorMode, u32>,
}

impl FailureCodeTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more failure of the given kind
    pub fn inc(&mut self, mode: InsertErrorMode) {
        self.inc_by(mode, 1);
    }

    fn inc_by(&mut self, mode: InsertErrorMode, count: u32) {
        *self.counts.entry(mode).or_insert(0) += count;
    }

    /// Add every count of another tracker to this one
    pub fn merge(&mut self, other: &FailureCodeTracker) {
        for (&mode, &count) in &other.counts {
            self.inc_by(mode, count);
        }
    }

    /// Number of failures of the given kind
    pub fn count(&self, mode: InsertErrorMode) -> u32 {
        self.counts.get(&mode).copied().unwrap_or(0)
    }

    /// Total number of failures recorded
    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Whether exactly one category has been recorded
    pub fn is_one_code_only(&self) -> bool {
        self.counts.len() == 1
    }

    /// Lowest-coded category recorded, if any
    pub fn first_code(&self) -> Option<InsertErrorMode> {
        self.counts.keys().next().copied()
    }

    /// Whether any recorded category is fatal
    pub fn is_fatal(&self) -> bool {
        self.counts.keys().any(|mode| mode.is_fatal())
    }

    /// Iterate over `(mode, count)` pairs in code order
    pub fn iter(&self) -> impl Iterator<Item = (InsertErrorMode, u32)> + '_ {
        self.counts.iter().map(|(&mode, &count)| (mode, count))
    }

    /// Serialize as `<code>=<count>` entries
    pub fn to_fieldset(&self) -> FieldSet {
        let mut fs = FieldSet::new();
        for (mode, count) in self.iter() {
            fs.put(&mode.code().to_string(), count);
        }
        fs
    }

    /// Rebuild a tracker from [`FailureCodeTracker::to_fieldset`] output
    pub fn from_fieldset(fs: &FieldSet) -> Result<Self, ResumeError> {
        let mut tracker = Self::new();
        for (key, value) in fs.values() {
            let mode = key
                .parse::<u8>()
                .ok()
                .and_then(InsertErrorMode::from_code)
                .ok_or_else(|| ResumeError::new(format!("Unknown failure code {}", key)))?;
            let count = value
                .parse::<u32>()
                .map_err(|e| ResumeError::new(format!("Corrupt failure count {}: {}", value, e)))?;
            tracker.inc_by(mode, count);
        }
        Ok(tracker)
    }
}

/// Terminal failure of a segment or of a whole insert
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", self.describe())]
pub struct InsertError {
    mode: InsertErrorMode,
    codes: Option<FailureCodeTracker>,
    message: Option<String>,
}

impl InsertError {
    /// Create an error of the given kind
    pub fn new(mode: InsertErrorMode) -> Self {
        Self {
            mode,
            codes: None,
            message: None,
        }
    }

    /// Create an error with extra detail
    pub fn with_message(mode: InsertErrorMode, message: impl Into<String>) -> Self {
        Self {
            mode,
            codes: None,
            message: Some(message.into()),
        }
    }

    /// Internal invariant violation
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_message(InsertErrorMode::InternalError, message)
    }

    /// Temporary storage failure
    pub fn bucket(message: impl Into<String>) -> Self {
        Self::with_message(InsertErrorMode::BucketError, message)
    }

    pub fn cancelled() -> Self {
        Self::new(InsertErrorMode::Cancelled)
    }

    /// Fold a tally of failures into one error
    ///
    /// A tally holding a single category yields that category; a mixed
    /// tally becomes `FatalErrorsInBlocks` if any category is fatal and
    /// `TooManyRetriesInBlocks` otherwise, carrying the tally along.
    pub fn from_tracker(tracker: &FailureCodeTracker) -> Self {
        if tracker.is_empty() {
            return Self::internal("no failures recorded");
        }
        if tracker.is_one_code_only() {
            if let Some(mode) = tracker.first_code() {
                return Self::new(mode);
            }
        }
        let mode = if tracker.is_fatal() {
            InsertErrorMode::FatalErrorsInBlocks
        } else {
            InsertErrorMode::TooManyRetriesInBlocks
        };
        Self {
            mode,
            codes: Some(tracker.clone()),
            message: None,
        }
    }

    pub fn mode(&self) -> InsertErrorMode {
        self.mode
    }

    /// Per-category breakdown, when this error aggregates several failures
    pub fn codes(&self) -> Option<&FailureCodeTracker> {
        self.codes.as_ref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether this failure dooms the whole insert
    pub fn is_fatal(&self) -> bool {
        self.mode.is_fatal()
    }

    fn describe(&self) -> String {
        let mut text = self.mode.to_string();
        if let Some(message) = &self.message {
            text.push_str(": ");
            text.push_str(message);
        }
        if let Some(codes) = &self.codes {
            let parts: Vec<String> = codes
                .iter()
                .map(|(mode, count)| format!("{} x{}", mode, count))
                .collect();
            text.push_str(&format!(" [{}]", parts.join(", ")));
        }
        text
    }

    pub(crate) fn to_fieldset(&self) -> FieldSet {
        let mut fs = FieldSet::new();
        fs.put("Mode", self.mode.code());
        if let Some(message) = &self.message {
            fs.put_single("Message", message.as_str());
        }
        if let Some(codes) = &self.codes {
            fs.put_subset("Errors", codes.to_fieldset());
        }
        fs
    }

    pub(crate) fn from_fieldset(fs: &FieldSet) -> Result<Self, ResumeError> {
        let code: u8 = fs
            .get_parsed("Mode")
            .map_err(|e| ResumeError::new(format!("Corrupt exception mode: {}", e)))?
            .ok_or_else(|| ResumeError::new("No exception mode"))?;
        let mode = InsertErrorMode::from_code(code)
            .ok_or_else(|| ResumeError::new(format!("Unknown exception mode {}", code)))?;
        let codes = fs
            .subset("Errors")
            .map(FailureCodeTracker::from_fieldset)
            .transpose()?;
        Ok(Self {
            mode,
            codes,
            message: fs.get("Message").map(str::to_string),
        })
    }
}

/// A persisted progress record could not be turned back into a live insert
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot resume insert: {reason}")]
pub struct ResumeError {
    reason: String,
}

impl ResumeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Human-readable reason
    pub fn reason(&self) -> &str {
        &self.reason
    }
}
