pub mod file_interaction_local_and_cloud;
