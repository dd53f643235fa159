//! Generated types for `floodgate.admission.v1`, compiled from
//! `proto/floodgate/admission/v1/admission.proto`.

tonic::include_proto!("floodgate.admission.v1");
