//! Master TCP server: accepts agent control sessions and CLI sessions on
//! one listener, distinguished by the first frame.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::models::{AgentRecord, AgentStatus, RunNotice};
use crate::domain::ports::{DispatchError, DispatchEvent, ShellPayload};
use crate::protocol::{
    read_frame, write_frame, AgentFrame, ClientRequest, ClientResponse, ErrorKind, Hello,
    MasterFrame, ProtocolError, RegisterReply,
};

use super::Master;

pub(super) async fn handle_connection(
    master: Arc<Master>,
    stream: TcpStream,
    shutdown: CancellationToken,
) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".to_string());
    let (mut reader, writer) = tokio::io::split(stream);

    let hello: Hello = match read_frame(&mut reader).await {
        Ok(hello) => hello,
        Err(e) => {
            debug!(peer = %peer, error = %e, "dropping connection before hello");
            return;
        }
    };

    match hello {
        Hello::Agent(request) => {
            handle_agent_session(master, reader, writer, request, shutdown).await;
        }
        Hello::Client => {
            handle_client_session(master, reader, writer).await;
        }
    }
}

async fn handle_agent_session<R, W>(
    master: Arc<Master>,
    mut reader: R,
    mut writer: W,
    request: crate::protocol::RegisterRequest,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let name = request.name.clone();
    let record = AgentRecord {
        name: request.name,
        address: request.address,
        report_address: request.report_address,
        status: AgentStatus::Active,
        last_heartbeat: chrono::Utc::now(),
        version: request.version,
        tags: request.tags,
        system_info: request.system_info,
        max_parallel_tasks: request.max_parallel_tasks,
        registered_at: chrono::Utc::now(),
    };

    if let Err(e) = master.registry.register(record).await {
        warn!(agent = %name, error = %e, "registration failed");
        let _ = write_frame(&mut writer, &RegisterReply::Rejected { reason: e.to_string() }).await;
        return;
    }
    if write_frame(&mut writer, &RegisterReply::Accepted).await.is_err() {
        return;
    }

    let (session_id, mut outbound, session_cancel) = master.channels.attach(&name).await;
    info!(agent = %name, %session_id, "control channel established");

    // Writer half: pump queued master frames down the connection.
    let writer_cancel = session_cancel.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = outbound.recv() => frame,
                _ = writer_cancel.cancelled() => None,
            };
            let Some(frame) = frame else { break };
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    // Reader half: route agent frames until the channel drops.
    loop {
        let frame: Result<AgentFrame, ProtocolError> = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = session_cancel.cancelled() => break,
            _ = shutdown.cancelled() => break,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(ProtocolError::ConnectionClosed) => break,
            Err(e) => {
                warn!(agent = %name, error = %e, "control channel error");
                break;
            }
        };

        match frame {
            AgentFrame::Heartbeat { name: hb_name, system_info } => {
                match master.registry.heartbeat(&hb_name, system_info).await {
                    Ok(()) => {
                        let _ = master.channels.send(&hb_name, MasterFrame::HeartbeatAck).await;
                    }
                    Err(_) => {
                        debug!(agent = %hb_name, "heartbeat from unknown agent");
                        let _ = master.channels.send(&name, MasterFrame::UnknownAgent).await;
                    }
                }
            }
            AgentFrame::Chunk(chunk) => master.channels.route_chunk(chunk).await,
            AgentFrame::Status(status) | AgentFrame::Redelivered(status) => {
                master.channels.route_status(status).await;
            }
            AgentFrame::Custom { workflow_run_id, event_type, payload } => {
                // Script-raised events go to the store verbatim.
                let wrapped = serde_json::json!({
                    "workflow_run_id": workflow_run_id,
                    "data": payload,
                });
                if let Err(e) = master.events.append(&event_type, wrapped).await {
                    warn!(agent = %name, error = %e, "failed to store custom event");
                }
            }
        }
    }

    master.channels.detach(&name, session_id).await;
    let _ = writer_task.await;

    if master.take_stop_requested(&name).await {
        master.registry.set_status(&name, AgentStatus::Stopped).await;
        info!(agent = %name, "agent stopped");
    } else {
        info!(agent = %name, "control channel closed");
    }
}

async fn handle_client_session<R, W>(master: Arc<Master>, mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let request: ClientRequest = match read_frame(&mut reader).await {
            Ok(request) => request,
            Err(ProtocolError::ConnectionClosed) => return,
            Err(e) => {
                debug!(error = %e, "client session error");
                return;
            }
        };
        if handle_client_request(&master, request, &mut writer).await.is_err() {
            return;
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn handle_client_request<W>(
    master: &Arc<Master>,
    request: ClientRequest,
    writer: &mut W,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    match request {
        ClientRequest::Ping => write_frame(writer, &ClientResponse::Pong).await,

        ClientRequest::ListAgents => {
            write_frame(writer, &ClientResponse::Agents(master.registry.list().await)).await
        }

        ClientRequest::GetAgent { name } => match master.registry.lookup(&name).await {
            Some(record) => write_frame(writer, &ClientResponse::Agent(record)).await,
            None => {
                write_frame(writer, &error_response(ErrorKind::AgentUnknown, &name)).await
            }
        },

        ClientRequest::DeleteAgent { name } => match master.registry.delete(&name).await {
            Ok(()) => write_frame(writer, &ClientResponse::Ok).await,
            Err(e) => write_frame(writer, &error_response(ErrorKind::AgentUnknown, &e.to_string())).await,
        },

        ClientRequest::StopAgent { name } => {
            master.mark_stop_requested(&name).await;
            if master.channels.send(&name, MasterFrame::Shutdown).await {
                write_frame(writer, &ClientResponse::Ok).await
            } else {
                write_frame(writer, &error_response(ErrorKind::AgentUnreachable, &name)).await
            }
        }

        ClientRequest::AgentRun { name, command, timeout_ms } => {
            let payload = ShellPayload {
                task_run_id: Uuid::new_v4(),
                command,
                env: Default::default(),
                timeout_ms,
            };
            match master
                .dispatcher
                .dispatch_shell(&name, payload, CancellationToken::new())
                .await
            {
                Ok(mut rx) => {
                    let mut finished = false;
                    while let Some(event) = rx.recv().await {
                        match event {
                            DispatchEvent::Chunk(chunk) => {
                                write_frame(writer, &ClientResponse::Chunk(chunk)).await?;
                            }
                            DispatchEvent::Done(status) => {
                                write_frame(writer, &ClientResponse::ExecDone(status)).await?;
                                finished = true;
                                break;
                            }
                            DispatchEvent::Custom { .. } => {}
                        }
                    }
                    if !finished {
                        write_frame(
                            writer,
                            &error_response(ErrorKind::AgentUnreachable, "channel dropped"),
                        )
                        .await?;
                    }
                    Ok(())
                }
                Err(e) => write_frame(writer, &dispatch_error_response(&e)).await,
            }
        }

        ClientRequest::RunWorkflow { definition } => {
            let run_id = Uuid::new_v4();
            let cancel = CancellationToken::new();
            master.register_run(run_id, cancel.clone()).await;

            let (notice_tx, mut notice_rx) = mpsc::channel::<RunNotice>(64);
            let engine = master.engine.clone();
            let run = tokio::spawn(async move {
                engine.run(run_id, definition, cancel, Some(notice_tx)).await
            });

            while let Some(notice) = notice_rx.recv().await {
                write_frame(writer, &ClientResponse::Notice(notice)).await?;
            }

            let result = run.await;
            master.unregister_run(run_id).await;
            match result {
                Ok(Ok(report)) => write_frame(writer, &ClientResponse::Report(report)).await,
                Ok(Err(e)) => {
                    write_frame(writer, &error_response(ErrorKind::PolicyViolation, &e.to_string()))
                        .await
                }
                Err(e) => {
                    write_frame(writer, &error_response(ErrorKind::Internal, &e.to_string())).await
                }
            }
        }

        ClientRequest::CancelRun { run_id } => {
            if master.cancel_run(run_id).await {
                write_frame(writer, &ClientResponse::Ok).await
            } else {
                write_frame(writer, &error_response(ErrorKind::NotFound, "run not active")).await
            }
        }

        ClientRequest::ListEvents { filter } => match master.events.list(filter).await {
            Ok(events) => write_frame(writer, &ClientResponse::Events(events)).await,
            Err(e) => write_frame(writer, &error_response(ErrorKind::Internal, &e.to_string())).await,
        },

        ClientRequest::GetEvent { id } => match master.events.get(id).await {
            Ok(Some(event)) => write_frame(writer, &ClientResponse::Event(event)).await,
            Ok(None) => write_frame(writer, &error_response(ErrorKind::NotFound, "event")).await,
            Err(e) => write_frame(writer, &error_response(ErrorKind::Internal, &e.to_string())).await,
        },

        ClientRequest::RetryEvent { id } => match master.events.requeue(id).await {
            Ok(()) => write_frame(writer, &ClientResponse::Ok).await,
            Err(e) => write_frame(writer, &error_response(ErrorKind::NotFound, &e.to_string())).await,
        },

        ClientRequest::ListHooks => match master.hooks.list().await {
            Ok(hooks) => write_frame(writer, &ClientResponse::Hooks(hooks)).await,
            Err(e) => write_frame(writer, &error_response(ErrorKind::Internal, &e.to_string())).await,
        },

        ClientRequest::RegisterHook { name, event_type, command } => {
            let hook = crate::domain::models::Hook::new(name, event_type, command);
            match master.hooks.insert(&hook).await {
                Ok(()) => write_frame(writer, &ClientResponse::HookRegistered { id: hook.id }).await,
                Err(e) => {
                    write_frame(writer, &error_response(ErrorKind::Internal, &e.to_string())).await
                }
            }
        }

        ClientRequest::DeleteHook { id } => match master.hooks.delete(id).await {
            Ok(()) => write_frame(writer, &ClientResponse::Ok).await,
            Err(e) => write_frame(writer, &error_response(ErrorKind::Internal, &e.to_string())).await,
        },
    }
}

fn error_response(kind: ErrorKind, message: &str) -> ClientResponse {
    ClientResponse::Error { kind, message: message.to_string() }
}

fn dispatch_error_response(error: &DispatchError) -> ClientResponse {
    let kind = match error {
        DispatchError::AgentUnknown(_) => ErrorKind::AgentUnknown,
        DispatchError::AgentUnreachable(_) | DispatchError::LocalUnavailable => {
            ErrorKind::AgentUnreachable
        }
        DispatchError::AgentBusy(_) => ErrorKind::AgentBusy,
    };
    ClientResponse::Error { kind, message: error.to_string() }
}
