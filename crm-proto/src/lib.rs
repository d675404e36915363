//! Generated CRI runtime/image types and the agent-intake service, compiled
//! from `proto/runtime.proto` / `proto/intake.proto` via `tonic-build`, the
//! same `tonic::include_proto!` pattern `zerovisor-sdk`'s CRI server binary
//! uses (there, a single `runtime.v1alpha2` package; here, two packages
//! since the intake service is a distinct UDS surface from the CRI one).

pub mod runtime {
    tonic::include_proto!("runtime.v1");
}

pub mod intake {
    tonic::include_proto!("rm.intake.v1");
}
