//! API endpoints for the DDoS mitigation service.
//!
//! This module provides HTTP endpoints for inspecting active bans, lifting
//! them by hand, checking which host group owns an address and looking at
//! the traffic of the last detection cycle.

use std::net::IpAddr;
use std::sync::Arc;
use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, Responder, ResponseError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::conntrack::{SessionDirection, SessionProtocol};
use crate::core::counters::{Direction, SortField, TotalCounterElement, TrafficCounters, TrafficSortOrder};
use crate::core::engine::{DetectionEngine, MitigationError};
use crate::core::network::{CidrMask, PrefixError};
use crate::core::serializers::{attack_details_to_json, describe_attack};
use crate::models::Config;

pub struct ApiState {
    pub engine: Arc<DetectionEngine>,
    pub config: Arc<Config>,
}

/// Errors returned by the HTTP handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error(transparent)]
    InvalidPrefix(#[from] PrefixError),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Mitigation(#[from] MitigationError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidAddress(_) | ApiError::InvalidPrefix(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Mitigation(_) => StatusCode::BAD_GATEWAY,
            ApiError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/bans").route(web::get().to(list_bans)))
            .service(
                web::resource("/bans/{address}/{prefix_len}")
                    .route(web::get().to(get_ban))
                    .route(web::delete().to(delete_ban)),
            )
            .service(web::resource("/host-groups/{address}").route(web::get().to(lookup_host_group)))
            .service(web::resource("/traffic").route(web::get().to(total_traffic)))
            .service(web::resource("/top-entities").route(web::get().to(top_entities)))
            .service(web::resource("/sessions/{address}").route(web::get().to(top_sessions))),
    );
}

const DEFAULT_LIMIT: usize = 10;

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    host_groups: usize,
    active_bans: usize,
    tracked_hosts: usize,
}

#[derive(Serialize)]
struct BanResponse {
    entity: String,
    attack: Value,
    report: String,
}

#[derive(Serialize)]
struct UnbanResponse {
    entity: String,
    withdrawn: bool,
}

#[derive(Serialize)]
struct DirectionTraffic {
    speed: TotalCounterElement,
    average_speed: TotalCounterElement,
    total: TotalCounterElement,
}

#[derive(Serialize)]
struct TrafficResponse {
    incoming: DirectionTraffic,
    outgoing: DirectionTraffic,
}

#[derive(Deserialize)]
struct TopEntitiesQuery {
    sort_by: Option<SortField>,
    direction: Option<Direction>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct EntityTraffic {
    entity: String,
    traffic: TrafficCounters,
}

#[derive(Deserialize)]
struct SessionsQuery {
    direction: Option<SessionDirection>,
    protocol: Option<SessionProtocol>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct SessionResponse {
    remote_address: String,
    remote_port: u16,
    local_port: u16,
    bytes: u64,
    packets: u64,
    last_update_time: u64,
}

fn parse_address(address: &str) -> Result<IpAddr, ApiError> {
    address
        .parse()
        .map_err(|_| ApiError::InvalidAddress(address.to_string()))
}

fn parse_entity(address: &str, prefix_len: u8) -> Result<CidrMask, ApiError> {
    Ok(CidrMask::new(parse_address(address)?, prefix_len)?)
}

/// Health check endpoint
async fn health_check(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        host_groups: state.config.host_groups.len(),
        active_bans: state.engine.bans().len(),
        tracked_hosts: state.engine.conntrack().host_count(),
    })
}

/// All active bans
async fn list_bans(state: web::Data<ApiState>) -> Result<HttpResponse, ApiError> {
    let bans = state
        .engine
        .bans()
        .list()
        .into_iter()
        .map(|(entity, attack)| -> Result<BanResponse, ApiError> {
            Ok(BanResponse {
                entity: entity.to_string(),
                attack: attack_details_to_json(&attack)?,
                report: describe_attack(&attack),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(HttpResponse::Ok().json(bans))
}

/// One ban, with its text report
async fn get_ban(
    state: web::Data<ApiState>,
    path: web::Path<(String, u8)>,
) -> Result<HttpResponse, ApiError> {
    let (address, prefix_len) = path.into_inner();
    let entity = parse_entity(&address, prefix_len)?;

    let attack = state
        .engine
        .bans()
        .get(&entity)
        .ok_or_else(|| ApiError::NotFound(format!("ban for {}", entity)))?;

    Ok(HttpResponse::Ok().json(BanResponse {
        entity: entity.to_string(),
        attack: attack_details_to_json(&attack)?,
        report: describe_attack(&attack),
    }))
}

/// Lift a ban and withdraw its Flow Spec rule
async fn delete_ban(
    state: web::Data<ApiState>,
    path: web::Path<(String, u8)>,
) -> Result<HttpResponse, ApiError> {
    let (address, prefix_len) = path.into_inner();
    let entity = parse_entity(&address, prefix_len)?;

    match state.engine.unban(&entity)? {
        Some(_) => Ok(HttpResponse::Ok().json(UnbanResponse {
            entity: entity.to_string(),
            withdrawn: true,
        })),
        None => Err(ApiError::NotFound(format!("ban for {}", entity))),
    }
}

/// Host group owning an address
async fn lookup_host_group(
    state: web::Data<ApiState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let address = parse_address(&path.into_inner())?;

    let found = state
        .engine
        .lookup(address)
        .ok_or_else(|| ApiError::NotFound(format!("host group for {}", address)))?;

    Ok(HttpResponse::Ok().json(found))
}

/// Installation-wide traffic of the last detection cycle
async fn total_traffic(state: web::Data<ApiState>) -> impl Responder {
    let totals = state.engine.total_traffic();
    let by_direction = |direction: Direction| DirectionTraffic {
        speed: *totals.speed(direction),
        average_speed: *totals.average_speed(direction),
        total: *totals.total(direction),
    };

    HttpResponse::Ok().json(TrafficResponse {
        incoming: by_direction(Direction::Incoming),
        outgoing: by_direction(Direction::Outgoing),
    })
}

/// Busiest entities of the last detection cycle
async fn top_entities(
    state: web::Data<ApiState>,
    query: web::Query<TopEntitiesQuery>,
) -> impl Responder {
    let order = TrafficSortOrder::new(
        query.sort_by.unwrap_or(SortField::Packets),
        query.direction.unwrap_or(Direction::Incoming),
    );

    let entities: Vec<EntityTraffic> = state
        .engine
        .top_entities(order, query.limit.unwrap_or(DEFAULT_LIMIT))
        .into_iter()
        .map(|(entity, traffic)| EntityTraffic {
            entity: entity.to_string(),
            traffic,
        })
        .collect();

    HttpResponse::Ok().json(entities)
}

/// Largest tracked sessions of one host
async fn top_sessions(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    query: web::Query<SessionsQuery>,
) -> Result<HttpResponse, ApiError> {
    let address = parse_address(&path.into_inner())?;

    let sessions: Vec<SessionResponse> = state
        .engine
        .conntrack()
        .top_sessions(
            address,
            query.direction.unwrap_or(SessionDirection::Incoming),
            query.protocol.unwrap_or(SessionProtocol::Tcp),
            query.limit.unwrap_or(DEFAULT_LIMIT),
        )
        .into_iter()
        .map(|(key, entry)| {
            let (remote_address, remote_port, local_port) = key.unpack();
            SessionResponse {
                remote_address: remote_address.to_string(),
                remote_port,
                local_port,
                bytes: entry.bytes,
                packets: entry.packets,
                last_update_time: entry.last_update_time,
            }
        })
        .collect();

    Ok(HttpResponse::Ok().json(sessions))
}
