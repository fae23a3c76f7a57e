pub(crate) mod cache_worker;
pub(crate) mod network_worker;
pub(crate) mod priority_queue;
pub(crate) mod waiting;

pub(crate) use cache_worker::CacheDispatcher;
pub(crate) use network_worker::NetworkDispatcher;
pub(crate) use priority_queue::DispatchQueue;
pub(crate) use waiting::WaitingRequestManager;
