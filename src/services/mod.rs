pub mod battery;
pub mod immediate_alert;
pub mod modem_info;
