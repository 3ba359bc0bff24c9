//! Kiln Protobuf Definitions
//!
//! Protocol Buffer definitions of the kiln API, used by the server, the
//! CLI and plugin processes.

pub mod mappers;

pub mod pb {
    tonic::include_proto!("v1");
}

pub use pb::{
    Annotation, FilterExpression, FilterOp, FilterTerm, GetJobRequest, GetJobResponse,
    JobConditions, JobMetadata, JobPhase, JobResult, JobStatus, JobTrigger, ListJobsRequest,
    ListJobsResponse, ListenRequest, ListenRequestLogs, ListenResponse, LogSliceEvent,
    LogSliceType, LoginRequest, LoginResponse, OrderExpression, Repository,
    StartFromPreviousJobRequest, StartGitHubJobRequest, StartJobResponse, StartLocalJobRequest,
    StopJobRequest, StopJobResponse, SubscribeRequest, SubscribeResponse,
};

pub use pb::kiln_service_client::KilnServiceClient;
pub use pb::kiln_service_server::{KilnService, KilnServiceServer};

pub use pb::repository_plugin_service_client::RepositoryPluginServiceClient;
pub use pb::repository_plugin_service_server::{
    RepositoryPluginService, RepositoryPluginServiceServer,
};

pub use pb::listen_response::Content as ListenContent;
pub use pb::{
    ContentInitContainerRequest, ContentInitContainerResponse, GetJobSpecRequest,
    GetJobSpecResponse, ResolveRequest, ResolveResponse,
};
