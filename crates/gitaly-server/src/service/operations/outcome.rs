//! Maps operation results onto the response envelopes.
//!
//! Business outcomes always come back as a successful response with the
//! matching field set. A response type that has no field for an outcome
//! is a server bug and turns into `Internal`.

use gitaly_error::GitalyError;
use gitaly_proto::gitaly::{
    user_cherry_pick_response, user_revert_response, Branch, OperationBranchUpdate, Tag,
    UserCherryPickResponse, UserCommitFilesResponse, UserCreateBranchResponse,
    UserCreateTagResponse, UserDeleteBranchResponse, UserDeleteTagResponse, UserFfBranchResponse,
    UserMergeBranchResponse, UserRebaseResponse, UserRevertResponse, UserSquashResponse,
};
use tonic::Status;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome<T> {
    Applied(T),
    Rejected(BusinessOutcome),
}

impl<T> Outcome<T> {
    pub(crate) fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Applied(value) => Outcome::Applied(f(value)),
            Self::Rejected(rejection) => Outcome::Rejected(rejection),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BusinessOutcome {
    /// pre-receive or update refused the change.
    HookRejected(String),
    AlreadyExists,
    CreateTree {
        failure: CreateTreeFailure,
        message: String,
    },
    Commit(String),
    Index(String),
    Git(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreateTreeFailure {
    Empty,
    Conflict,
}

impl BusinessOutcome {
    fn kind(&self) -> &'static str {
        match self {
            Self::HookRejected(_) => "hook rejection",
            Self::AlreadyExists => "existing reference",
            Self::CreateTree { .. } => "create tree error",
            Self::Commit(_) => "commit error",
            Self::Index(_) => "index error",
            Self::Git(_) => "git error",
        }
    }
}

pub(crate) trait Envelope: Sized {
    type Applied;

    fn applied(value: Self::Applied) -> Self;

    /// `None` when the response has no field for `outcome`.
    fn rejected(outcome: &BusinessOutcome) -> Option<Self>;
}

pub(crate) fn into_envelope<E: Envelope>(outcome: Outcome<E::Applied>) -> Result<E, Status> {
    match outcome {
        Outcome::Applied(value) => Ok(E::applied(value)),
        Outcome::Rejected(rejection) => E::rejected(&rejection).ok_or_else(|| {
            GitalyError::internal(format!(
                "response cannot carry a {}: {rejection:?}",
                rejection.kind()
            ))
            .into()
        }),
    }
}

impl Envelope for UserCreateBranchResponse {
    type Applied = Branch;

    fn applied(branch: Branch) -> Self {
        Self {
            branch: Some(branch),
            ..Self::default()
        }
    }

    fn rejected(outcome: &BusinessOutcome) -> Option<Self> {
        match outcome {
            BusinessOutcome::HookRejected(message) => Some(Self {
                pre_receive_error: message.clone(),
                ..Self::default()
            }),
            // The branch is already there: nothing to report.
            BusinessOutcome::AlreadyExists => Some(Self::default()),
            _ => None,
        }
    }
}

impl Envelope for UserDeleteBranchResponse {
    type Applied = ();

    fn applied((): ()) -> Self {
        Self::default()
    }

    fn rejected(outcome: &BusinessOutcome) -> Option<Self> {
        match outcome {
            BusinessOutcome::HookRejected(message) => Some(Self {
                pre_receive_error: message.clone(),
            }),
            _ => None,
        }
    }
}

impl Envelope for UserCreateTagResponse {
    type Applied = Tag;

    fn applied(tag: Tag) -> Self {
        Self {
            tag: Some(tag),
            ..Self::default()
        }
    }

    fn rejected(outcome: &BusinessOutcome) -> Option<Self> {
        match outcome {
            BusinessOutcome::HookRejected(message) => Some(Self {
                pre_receive_error: message.clone(),
                ..Self::default()
            }),
            BusinessOutcome::AlreadyExists => Some(Self {
                exists: true,
                ..Self::default()
            }),
            _ => None,
        }
    }
}

impl Envelope for UserDeleteTagResponse {
    type Applied = ();

    fn applied((): ()) -> Self {
        Self::default()
    }

    fn rejected(outcome: &BusinessOutcome) -> Option<Self> {
        match outcome {
            BusinessOutcome::HookRejected(message) => Some(Self {
                pre_receive_error: message.clone(),
            }),
            _ => None,
        }
    }
}

impl Envelope for UserMergeBranchResponse {
    type Applied = OperationBranchUpdate;

    fn applied(branch_update: OperationBranchUpdate) -> Self {
        Self {
            branch_update: Some(branch_update),
            ..Self::default()
        }
    }

    fn rejected(outcome: &BusinessOutcome) -> Option<Self> {
        match outcome {
            BusinessOutcome::HookRejected(message) => Some(Self {
                pre_receive_error: message.clone(),
                ..Self::default()
            }),
            _ => None,
        }
    }
}

impl Envelope for UserFfBranchResponse {
    type Applied = OperationBranchUpdate;

    fn applied(branch_update: OperationBranchUpdate) -> Self {
        Self {
            branch_update: Some(branch_update),
            ..Self::default()
        }
    }

    fn rejected(outcome: &BusinessOutcome) -> Option<Self> {
        match outcome {
            BusinessOutcome::HookRejected(message) => Some(Self {
                pre_receive_error: message.clone(),
                ..Self::default()
            }),
            _ => None,
        }
    }
}

// Cherry-pick and revert share their response layout.
macro_rules! pick_envelope {
    ($response:ty, $codes:ident) => {
        impl Envelope for $response {
            type Applied = OperationBranchUpdate;

            fn applied(branch_update: OperationBranchUpdate) -> Self {
                Self {
                    branch_update: Some(branch_update),
                    ..Self::default()
                }
            }

            fn rejected(outcome: &BusinessOutcome) -> Option<Self> {
                let response = match outcome {
                    BusinessOutcome::HookRejected(message) => Self {
                        pre_receive_error: message.clone(),
                        ..Self::default()
                    },
                    BusinessOutcome::CreateTree { failure, message } => {
                        let code = match failure {
                            CreateTreeFailure::Empty => $codes::CreateTreeError::Empty,
                            CreateTreeFailure::Conflict => $codes::CreateTreeError::Conflict,
                        };
                        Self {
                            create_tree_error: message.clone(),
                            create_tree_error_code: code as i32,
                            ..Self::default()
                        }
                    }
                    BusinessOutcome::Commit(message) => Self {
                        commit_error: message.clone(),
                        ..Self::default()
                    },
                    _ => return None,
                };
                Some(response)
            }
        }
    };
}

pick_envelope!(UserCherryPickResponse, user_cherry_pick_response);
pick_envelope!(UserRevertResponse, user_revert_response);

impl Envelope for UserCommitFilesResponse {
    type Applied = OperationBranchUpdate;

    fn applied(branch_update: OperationBranchUpdate) -> Self {
        Self {
            branch_update: Some(branch_update),
            ..Self::default()
        }
    }

    fn rejected(outcome: &BusinessOutcome) -> Option<Self> {
        match outcome {
            BusinessOutcome::HookRejected(message) => Some(Self {
                pre_receive_error: message.clone(),
                ..Self::default()
            }),
            BusinessOutcome::Index(message) => Some(Self {
                index_error: message.clone(),
                ..Self::default()
            }),
            _ => None,
        }
    }
}

impl Envelope for UserRebaseResponse {
    type Applied = String;

    fn applied(rebase_sha: String) -> Self {
        Self {
            rebase_sha,
            ..Self::default()
        }
    }

    fn rejected(outcome: &BusinessOutcome) -> Option<Self> {
        match outcome {
            BusinessOutcome::HookRejected(message) => Some(Self {
                pre_receive_error: message.clone(),
                ..Self::default()
            }),
            BusinessOutcome::Git(message) => Some(Self {
                git_error: message.clone(),
                ..Self::default()
            }),
            _ => None,
        }
    }
}

impl Envelope for UserSquashResponse {
    type Applied = String;

    fn applied(squash_sha: String) -> Self {
        Self {
            squash_sha,
            ..Self::default()
        }
    }

    fn rejected(outcome: &BusinessOutcome) -> Option<Self> {
        match outcome {
            BusinessOutcome::Git(message) => Some(Self {
                git_error: message.clone(),
                ..Self::default()
            }),
            _ => None,
        }
    }
}
