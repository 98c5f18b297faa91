//! Consensus module wiring.
//!
//! `lock` guards streams, `stream` caches ledger entities, `contract` and
//! `executor` run contract phases, `coordinator` drives one transaction
//! across the network and `engine` hosts coordinators for a node. `store`,
//! `transport` and `verify` define the external seams with in-memory
//! implementations where useful.

mod contract;
mod coordinator;
mod engine;
mod error;
mod executor;
mod lock;
mod store;
mod stream;
mod summary;
mod transport;
mod types;
mod verify;

pub use contract::{
    Capability, CapabilitySet, Contract, ContractContext, ContractFactory, ContractRegistry,
    PhaseResult, Rejection,
};
pub use coordinator::{
    ConsensusCoordinator, DUPLICATE_TRANSACTION, NOT_IN_FLIGHT, STREAM_POSITION_INCORRECT,
};
pub use engine::{EngineInfo, EngineServices, LedgerEngine};
pub use error::{ErrorKind, LedgerError};
pub use executor::{ContractExecutor, Phase, PhaseFailure};
pub use lock::{HeldStreams, StreamLock};
pub use store::{
    next_revision, AllDocsOptions, Change, Changes, ContractEvent, Document, EventSink,
    MemoryStore, PersistenceStore, QueryEngine, Selector, StoreEvents, StoreInfo, StoreQuery,
};
pub use stream::{
    derive_stream_id, state_doc_id, volatile_doc_id, ActivityStream, StreamMeta, StreamView,
    STATE_SUFFIX, VOLATILE_SUFFIX,
};
pub use summary::{
    record_vote_response, select_territoriality, QuorumPolicy, Summary, SummaryError, VoteTally,
};
pub use transport::{Knock, KnockBody, KnockHandler, MemoryTransport, NetworkTransport};
pub use types::{
    Config, LedgerResponse, NodeRef, NodeResponse, StreamId, StreamRecord, StreamsAffected,
    TxBody, TxEntry, TxPacket, TxRecord, TxStatus, Umid,
};
pub use verify::{
    check_contract_lock, check_signatures, SignatureVerifier, CONTRACT_LOCKED,
    SIGNATURES_NOT_VERIFIED,
};
