mod admin_tests;
mod health_tests;
mod websocket_tests;
