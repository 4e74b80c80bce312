tonic::include_proto!("model_server");

pub const FILE_DESCRIPTOR_SET: &[u8] =
    tonic::include_file_descriptor_set!("model_server_descriptor");
