/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum OperatorError {
    /// The generic object cannot be converted into the typed custom resource.
    #[error("{0}")]
    Conversion(String),
    /// The fields owned by a field manager could not be determined.
    #[error("{0}")]
    Extraction(String),
    /// Fields owned by a field manager were changed concurrently.
    #[error("{0}")]
    Conflict(String),
    /// Two controllers registered with the same name.
    #[error("{0}")]
    DuplicateName(String),
    /// Install and remove predicates of a conditional resource both hold.
    #[error("{0}")]
    PredicateConflict(String),
    /// The object (or its kind) does not exist.
    #[error("{0}")]
    NotFound(String),
    /// The source object of a sync does not exist.
    #[error("{0}")]
    SourceNotFound(String),
    /// A manifest hook failed.
    #[error("{0}")]
    Hook(String),
    /// Unknown or malformed asset.
    #[error("{0}")]
    Asset(String),
    #[error("{0}")]
    UnsupportedManagementState(String),
    /// Several independent operations of one tick failed.
    #[error("{}", .0.join("; "))]
    Aggregate(Vec<String>),
    /// A controller panicked while reconciling.
    #[error("{0}")]
    Panic(String),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl OperatorError {
    pub(crate) fn is_conflict(&self) -> bool {
        match self {
            OperatorError::Conflict(_) => true,
            OperatorError::KubeApi(e) => e.is_conflict(),
            _ => false,
        }
    }

    pub(crate) fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound(_) => true,
            OperatorError::KubeApi(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Programmatic reason used for conditions and events.
    pub(crate) fn reason(&self) -> &'static str {
        match self {
            OperatorError::Conversion(_) => "ConversionError",
            OperatorError::Extraction(_) => "ExtractionError",
            OperatorError::Conflict(_) => "ConflictError",
            OperatorError::DuplicateName(_) => "DuplicateNameError",
            OperatorError::PredicateConflict(_) => "PredicateConflictError",
            OperatorError::SourceNotFound(_) => "SourceNotFound",
            OperatorError::Hook(_) => "HookError",
            OperatorError::UnsupportedManagementState(_) => "UnsupportedManagementState",
            OperatorError::Panic(_) => "Panic",
            _ => "SyncError",
        }
    }

    /// Collapse a list of errors into a single error, `None` if there are none.
    pub(crate) fn aggregate(mut errors: Vec<OperatorError>) -> Option<OperatorError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(OperatorError::Aggregate(
                errors.iter().map(|e| e.to_string()).collect(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate() {
        assert!(OperatorError::aggregate(vec![]).is_none());
        let single = OperatorError::aggregate(vec![OperatorError::Hook("a".into())]).unwrap();
        assert_eq!("HookError", single.reason());
        let many = OperatorError::aggregate(vec![
            OperatorError::Hook("a".into()),
            OperatorError::NotFound("b".into()),
        ])
        .unwrap();
        assert_eq!("a; b", many.to_string());
        assert_eq!("SyncError", many.reason());
    }

    #[test]
    fn classification() {
        assert!(OperatorError::Conflict("x".into()).is_conflict());
        assert!(OperatorError::NotFound("x".into()).is_not_found());
        assert!(!OperatorError::Hook("x".into()).is_not_found());
    }
}
