// Domain layer - business logic organized per domain.
//
// Infrastructure (storage, providers, queueing) lives in `kernel`; the
// modules here compose it into the research pipeline.

pub mod research;
