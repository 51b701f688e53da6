pub mod blazeface;
pub mod emotion_net;
