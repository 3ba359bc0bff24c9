//! The kiln gRPC surface

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};
use tracing::info;

use kiln_application::{ListenEvent, LogListenMode, Service};
use kiln_logcutter::SliceType;
use kiln_ports::{NumberGroup, TokenStore};
use kiln_proto::mappers::{
    error_to_status, filter_from_pb, metadata_from_pb, order_from_pb, status_to_pb,
};
use kiln_proto::{
    GetJobRequest, GetJobResponse, KilnService, ListJobsRequest, ListJobsResponse, ListenRequest,
    ListenRequestLogs, ListenResponse, LogSliceType, LoginRequest, LoginResponse,
    StartFromPreviousJobRequest, StartGitHubJobRequest, StartJobResponse, StartLocalJobRequest,
    StopJobRequest, StopJobResponse, SubscribeRequest, SubscribeResponse,
};

use crate::auth::authorize;
use crate::content::TarballContentProvider;
use crate::providers::ProviderRegistry;

const DEFAULT_PAGE_SIZE: i64 = 50;

pub struct KilnApi {
    service: Arc<Service>,
    tokens: Arc<dyn TokenStore>,
    groups: Arc<dyn NumberGroup>,
    providers: Arc<ProviderRegistry>,
    content_dir: PathBuf,
    base_url: String,
}

impl KilnApi {
    pub fn new(
        service: Arc<Service>,
        tokens: Arc<dyn TokenStore>,
        groups: Arc<dyn NumberGroup>,
        providers: Arc<ProviderRegistry>,
        content_dir: PathBuf,
        base_url: String,
    ) -> Self {
        KilnApi {
            service,
            tokens,
            groups,
            providers,
            content_dir,
            base_url,
        }
    }

    /// Derives the base a job's sequential names build on, e.g.
    /// `widgets-main` from `widgets-main.3`.
    fn name_base(name: &str) -> &str {
        match name.rsplit_once('.') {
            Some((base, suffix)) if suffix.chars().all(|c| c.is_ascii_digit()) => base,
            _ => name,
        }
    }
}

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

#[tonic::async_trait]
impl KilnService for KilnApi {
    type SubscribeStream = ResponseStream<SubscribeResponse>;
    type ListenStream = ResponseStream<ListenResponse>;

    async fn start_local_job(
        &self,
        request: Request<StartLocalJobRequest>,
    ) -> Result<Response<StartJobResponse>, Status> {
        authorize(self.tokens.as_ref(), &request).await?;
        let req = request.into_inner();
        let metadata = req
            .metadata
            .as_ref()
            .map(metadata_from_pb)
            .ok_or_else(|| Status::invalid_argument("metadata is required"))?;

        let n = self
            .groups
            .next("local")
            .await
            .map_err(|e| error_to_status(&e))?;
        let name = format!("local-{n}");

        let provider = TarballContentProvider::store(
            &self.content_dir,
            &self.base_url,
            &name,
            &req.workspace_tar,
        )
        .await
        .map_err(|e| error_to_status(&e))?;

        info!(job = %name, owner = %metadata.owner, "starting local job");
        let status = self
            .service
            .run_job(&name, metadata, &provider, &req.job_yaml, false)
            .await
            .map_err(|e| error_to_status(&e))?;

        Ok(Response::new(StartJobResponse {
            status: Some(status_to_pb(&status)),
        }))
    }

    async fn start_git_hub_job(
        &self,
        request: Request<StartGitHubJobRequest>,
    ) -> Result<Response<StartJobResponse>, Status> {
        authorize(self.tokens.as_ref(), &request).await?;
        let req = request.into_inner();
        let metadata = req
            .metadata
            .as_ref()
            .map(metadata_from_pb)
            .ok_or_else(|| Status::invalid_argument("metadata is required"))?;
        let repo = metadata.repository.clone();

        let provider = self.providers.get(&repo.host).ok_or_else(|| {
            Status::failed_precondition(format!(
                "no repository provider registered for {}",
                repo.host
            ))
        })?;

        let job_yaml = provider
            .job_spec(&repo, &req.job_path)
            .await
            .map_err(|e| error_to_status(&e))?;
        let content = provider
            .content_provider(&repo)
            .await
            .map_err(|e| error_to_status(&e))?;

        let short_ref = repo
            .ref_
            .trim_start_matches("refs/heads/")
            .replace('/', "-");
        let base = format!("{}-{}", repo.repo, short_ref);
        let n = self
            .groups
            .next(&base)
            .await
            .map_err(|e| error_to_status(&e))?;
        let name = format!("{base}.{n}");

        info!(job = %name, repo = %repo.repo, "starting repository job");
        let status = self
            .service
            .run_job(&name, metadata, content.as_ref(), &job_yaml, true)
            .await
            .map_err(|e| error_to_status(&e))?;

        Ok(Response::new(StartJobResponse {
            status: Some(status_to_pb(&status)),
        }))
    }

    async fn start_from_previous_job(
        &self,
        request: Request<StartFromPreviousJobRequest>,
    ) -> Result<Response<StartJobResponse>, Status> {
        authorize(self.tokens.as_ref(), &request).await?;
        let req = request.into_inner();

        let previous = self
            .service
            .get_job(&req.previous_job)
            .await
            .map_err(|e| error_to_status(&e))?
            .ok_or_else(|| Status::not_found(format!("unknown job: {}", req.previous_job)))?;
        let job_yaml = self
            .service
            .get_job_spec(&req.previous_job)
            .await
            .map_err(|e| error_to_status(&e))?
            .ok_or_else(|| {
                Status::failed_precondition(format!("job {} cannot be replayed", req.previous_job))
            })?;

        let mut metadata = previous.metadata.clone();
        metadata.created = None;
        metadata.finished = None;

        let provider = self
            .providers
            .get(&metadata.repository.host)
            .ok_or_else(|| {
                Status::failed_precondition(format!(
                    "no repository provider registered for {}",
                    metadata.repository.host
                ))
            })?;
        let content = provider
            .content_provider(&metadata.repository)
            .await
            .map_err(|e| error_to_status(&e))?;

        let base = Self::name_base(&req.previous_job).to_string();
        let n = self
            .groups
            .next(&base)
            .await
            .map_err(|e| error_to_status(&e))?;
        let name = format!("{base}.{n}");

        info!(job = %name, previous = %req.previous_job, "replaying job");
        let status = self
            .service
            .run_job(&name, metadata, content.as_ref(), &job_yaml, true)
            .await
            .map_err(|e| error_to_status(&e))?;

        Ok(Response::new(StartJobResponse {
            status: Some(status_to_pb(&status)),
        }))
    }

    async fn list_jobs(
        &self,
        request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        authorize(self.tokens.as_ref(), &request).await?;
        let req = request.into_inner();

        let filter = filter_from_pb(&req.filter);
        let order = order_from_pb(&req.order);
        let limit = if req.limit > 0 {
            req.limit as i64
        } else {
            DEFAULT_PAGE_SIZE
        };

        let (jobs, total) = self
            .service
            .list_jobs(&filter, &order, req.start as i64, limit)
            .await
            .map_err(|e| error_to_status(&e))?;

        Ok(Response::new(ListJobsResponse {
            total: total as i32,
            result: jobs.iter().map(status_to_pb).collect(),
        }))
    }

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        authorize(self.tokens.as_ref(), &request).await?;
        let req = request.into_inner();

        let rx = self.service.subscribe(filter_from_pb(&req.filter));
        let stream = ReceiverStream::new(rx).map(|status| {
            Ok(SubscribeResponse {
                result: Some(status_to_pb(&status)),
            })
        });
        Ok(Response::new(Box::pin(stream) as Self::SubscribeStream))
    }

    async fn get_job(
        &self,
        request: Request<GetJobRequest>,
    ) -> Result<Response<GetJobResponse>, Status> {
        authorize(self.tokens.as_ref(), &request).await?;
        let req = request.into_inner();

        let status = self
            .service
            .get_job(&req.name)
            .await
            .map_err(|e| error_to_status(&e))?
            .ok_or_else(|| Status::not_found(format!("unknown job: {}", req.name)))?;
        Ok(Response::new(GetJobResponse {
            result: Some(status_to_pb(&status)),
        }))
    }

    async fn listen(
        &self,
        request: Request<ListenRequest>,
    ) -> Result<Response<Self::ListenStream>, Status> {
        authorize(self.tokens.as_ref(), &request).await?;
        let req = request.into_inner();

        let mode = match req.logs() {
            ListenRequestLogs::LogsDisabled => LogListenMode::Disabled,
            ListenRequestLogs::LogsUnsliced => LogListenMode::Unsliced,
            ListenRequestLogs::LogsRaw => LogListenMode::Raw,
            ListenRequestLogs::LogsHtml => LogListenMode::Html,
        };

        let rx = self
            .service
            .listen(&req.name, req.updates, mode)
            .await
            .map_err(|e| error_to_status(&e))?;

        let stream = ReceiverStream::new(rx).map(|event| Ok(listen_event_to_pb(event)));
        Ok(Response::new(Box::pin(stream) as Self::ListenStream))
    }

    async fn stop_job(
        &self,
        request: Request<StopJobRequest>,
    ) -> Result<Response<StopJobResponse>, Status> {
        authorize(self.tokens.as_ref(), &request).await?;
        let req = request.into_inner();

        self.service
            .stop_job(&req.name)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(StopJobResponse {}))
    }

    async fn login(
        &self,
        request: Request<LoginRequest>,
    ) -> Result<Response<LoginResponse>, Status> {
        let req = request.into_inner();
        if req.username.is_empty() {
            return Err(Status::invalid_argument("username is required"));
        }

        let token = uuid::Uuid::new_v4().to_string();
        self.tokens
            .store(&token, &req.username)
            .await
            .map_err(|e| error_to_status(&e))?;
        info!(user = %req.username, "issued API token");

        Ok(Response::new(LoginResponse { token }))
    }
}

fn listen_event_to_pb(event: ListenEvent) -> ListenResponse {
    let content = match event {
        ListenEvent::Update(status) => {
            kiln_proto::ListenContent::Update(status_to_pb(&status))
        }
        ListenEvent::Slice(slice) => kiln_proto::ListenContent::Slice(kiln_proto::LogSliceEvent {
            r#type: match slice.slice_type {
                SliceType::Content => LogSliceType::SliceContent,
                SliceType::Phase => LogSliceType::SlicePhase,
                SliceType::Result => LogSliceType::SliceResult,
            } as i32,
            name: slice.name,
            payload: slice.payload,
        }),
    };
    ListenResponse {
        content: Some(content),
    }
}
