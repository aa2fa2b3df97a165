pub mod convert;

pub mod ring {
    tonic::include_proto!("ring");
}
