//! Generated gRPC definitions for the SPQR control plane

tonic::include_proto!("spqr.v1");
